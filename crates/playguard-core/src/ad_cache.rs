//! Ad pod prefetch cache
//!
//! Holds at most one in-flight ad-pod fetch per content id. Fetches are
//! started ahead of playback and consumed when playback for the same id
//! begins. Clearing the cache for a different id never cancels a fetch; the
//! fetch is left to finish and its outcome is reported as a missed-ad event.
//!
//! The cache is an explicit, session-owned object: build one per session and
//! hand it to whoever needs it.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    pending::{OperationHandle, PendingOperationRegistry, StartOptions},
    telemetry::{
        TelemetryEvent, TelemetrySink, SUBTYPE_PREFETCH_FAILURE, SUBTYPE_PREFETCH_SUCCESS,
        TYPE_ADS,
    },
    types::{total_ad_duration_ms, AdPod, AdPodResponse, PresetAdType},
    Error, Result,
};

/// Handler name used for prefetches in the pending registry
pub const PREFETCH_HANDLER_NAME: &str = "adPrefetch";

/// Cloneable in-flight (or settled) ad-pod fetch
///
/// Resolves to `None` when nothing usable was fetched.
pub type AdPrefetch = Shared<BoxFuture<'static, Option<AdPod>>>;

/// Wrap an already-known outcome as a settled prefetch
pub fn ready_prefetch(ads: Option<AdPod>) -> AdPrefetch {
    futures::future::ready(ads).boxed().shared()
}

/// Request handed to the ad-pod endpoint collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct AdPodRequest {
    pub content_id: String,
    pub pre_request_from: PresetAdType,
    pub is_series: bool,
    pub timeout: Duration,
}

/// Ad-pod endpoint collaborator
///
/// Failures should be reported as [`Error::FetchFailure`].
#[async_trait]
pub trait AdPodFetcher: Send + Sync {
    async fn fetch(&self, request: &AdPodRequest) -> Result<AdPodResponse>;
}

/// Values stored by [`AdPrefetchCache::set_cache_item`]
#[derive(Clone)]
pub struct AdCacheItem {
    pub ads_pre_fetch: Option<AdPrefetch>,
    pub pre_request_from: PresetAdType,
    pub is_series: bool,
}

/// Cached prefetch for one content id
#[derive(Clone)]
pub struct AdCacheEntry {
    pub content_id: String,
    pub ads_pre_fetch: Option<AdPrefetch>,
    pub pre_request_from: PresetAdType,
    pub is_series: bool,
}

impl std::fmt::Debug for AdCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdCacheEntry")
            .field("content_id", &self.content_id)
            .field("has_prefetch", &self.ads_pre_fetch.is_some())
            .field("pre_request_from", &self.pre_request_from)
            .field("is_series", &self.is_series)
            .finish()
    }
}

/// Options for [`AdPrefetchCache::fetch_and_cache`]
#[derive(Debug, Clone, Copy)]
pub struct FetchAndCacheOptions {
    pub pre_request_from: PresetAdType,
    pub is_series: bool,
    pub timeout: Duration,
    /// Cache an empty pod on failure instead of nothing
    pub skip_error: bool,
}

/// Per-content-id cache of ad-pod prefetches
#[derive(Clone)]
pub struct AdPrefetchCache {
    entries: Arc<Mutex<HashMap<String, AdCacheEntry>>>,
    /// Registry handles of fetches that have not settled yet
    in_flight: Arc<Mutex<HashMap<String, OperationHandle<AdPodResponse>>>>,
    fetcher: Arc<dyn AdPodFetcher>,
    sink: Arc<dyn TelemetrySink>,
    pending: PendingOperationRegistry,
}

impl AdPrefetchCache {
    pub fn new(
        fetcher: Arc<dyn AdPodFetcher>,
        sink: Arc<dyn TelemetrySink>,
        pending: PendingOperationRegistry,
    ) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            fetcher,
            sink,
            pending,
        }
    }

    /// Register or replace the entry for `id`
    pub fn set_cache_item(&self, id: &str, item: AdCacheItem) {
        let replaced = self.entries.lock().insert(
            id.to_string(),
            AdCacheEntry {
                content_id: id.to_string(),
                ads_pre_fetch: item.ads_pre_fetch,
                pre_request_from: item.pre_request_from,
                is_series: item.is_series,
            },
        );
        debug!(content_id = id, replaced = replaced.is_some(), "Ad cache item set");
    }

    pub fn get_cache_item(&self, id: &str) -> Option<AdCacheEntry> {
        self.entries.lock().get(id).cloned()
    }

    /// Remove and return the entry when playback for `id` begins
    pub fn consume(&self, id: &str) -> Option<AdCacheEntry> {
        self.entries.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry except `current_id`
    ///
    /// Each evicted prefetch is left running; once it settles a missed-ad
    /// event is sent. Returns the number of evicted entries.
    pub fn clear(&self, current_id: Option<&str>) -> usize {
        let mut evicted = Vec::new();
        self.entries.lock().retain(|id, entry| {
            if Some(id.as_str()) == current_id {
                true
            } else {
                evicted.push(entry.clone());
                false
            }
        });

        for entry in &evicted {
            // Evicted fetches outlive the session's pending operations
            let handle = self.in_flight.lock().remove(&entry.content_id);
            if let Some(handle) = handle {
                self.pending.release(&handle);
            }
            let Some(prefetch) = entry.ads_pre_fetch.clone() else {
                continue;
            };
            let sink = self.sink.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                let ads = prefetch.await.unwrap_or_default();
                info!(
                    content_id = %entry.content_id,
                    ad_count = ads.len(),
                    "Reporting missed ad pod"
                );
                sink.send(TelemetryEvent::missed_ad(
                    &entry.content_id,
                    entry.pre_request_from,
                    ads.len(),
                    entry.is_series,
                    total_ad_duration_ms(&ads),
                ));
            });
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), keep = ?current_id, "Ad cache cleared");
        }
        evicted.len()
    }

    /// Fetch the ad pod for `content_id` and cache the in-flight result
    ///
    /// An existing entry with a prefetch is returned as is, so a failing id
    /// is not retried within the session. The fetch is tracked by the
    /// pending registry with `options.timeout`.
    #[instrument(skip(self, options), fields(pre_request_from = %options.pre_request_from))]
    pub fn fetch_and_cache(&self, content_id: &str, options: FetchAndCacheOptions) -> AdPrefetch {
        if let Some(existing) = self
            .get_cache_item(content_id)
            .and_then(|entry| entry.ads_pre_fetch)
        {
            debug!("Reusing cached ad prefetch");
            return existing;
        }

        let request = AdPodRequest {
            content_id: content_id.to_string(),
            pre_request_from: options.pre_request_from,
            is_series: options.is_series,
            timeout: options.timeout,
        };
        let fetcher = self.fetcher.clone();
        let promise = self.pending.create_promise(
            move |handle: OperationHandle<AdPodResponse>| {
                tokio::spawn(async move {
                    match fetcher.fetch(&request).await {
                        Ok(response) => handle.resolve(response),
                        Err(err) => handle.reject(err),
                    };
                });
                None
            },
            StartOptions::new()
                .timeout(options.timeout)
                .handler_name(PREFETCH_HANDLER_NAME),
        );

        self.in_flight
            .lock()
            .insert(content_id.to_string(), promise.handle().clone());

        let sink = self.sink.clone();
        let in_flight = self.in_flight.clone();
        let id = content_id.to_string();
        let prefetch = async move {
            let outcome = promise.await;
            in_flight.lock().retain(|_, handle| !handle.is_settled());
            match outcome {
                Ok(response) => {
                    info!(content_id = %id, ad_count = response.ads.len(), "Ad pod prefetched");
                    sink.send(success_event(&id, &options, &response));
                    Some(response.ads)
                }
                Err(err) => {
                    warn!(content_id = %id, error = %err, "Ad pod prefetch failed");
                    sink.send(failure_event(&id, &options, &err));
                    options.skip_error.then(Vec::new)
                }
            }
        }
        .boxed()
        .shared();

        // Drive the fetch to completion even if nobody awaits it
        tokio::spawn(prefetch.clone());

        self.set_cache_item(
            content_id,
            AdCacheItem {
                ads_pre_fetch: Some(prefetch.clone()),
                pre_request_from: options.pre_request_from,
                is_series: options.is_series,
            },
        );
        prefetch
    }
}

impl std::fmt::Debug for AdPrefetchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdPrefetchCache")
            .field("entries", &self.len())
            .finish()
    }
}

fn base_fields(content_id: &str, options: &FetchAndCacheOptions) -> Map<String, serde_json::Value> {
    let mut message = Map::new();
    message.insert("content_id".into(), json!(content_id));
    message.insert("preRequestFrom".into(), json!(options.pre_request_from.to_string()));
    message.insert("isSeries".into(), json!(options.is_series));
    message
}

fn success_event(
    content_id: &str,
    options: &FetchAndCacheOptions,
    response: &AdPodResponse,
) -> TelemetryEvent {
    let mut message = base_fields(content_id, options);
    message.insert("adCount".into(), json!(response.ads.len()));
    message.insert("responseTime".into(), json!(response.metrics.response_time));
    message.insert(
        "networkResponseTime".into(),
        json!(response.metrics.network_response_time),
    );
    message.insert("requestQueueTime".into(), json!(response.metrics.request_queue_time));
    message.insert("retries".into(), json!(response.metrics.retries));
    TelemetryEvent::new(TYPE_ADS, SUBTYPE_PREFETCH_SUCCESS, message)
}

fn failure_event(content_id: &str, options: &FetchAndCacheOptions, err: &Error) -> TelemetryEvent {
    let mut message = base_fields(content_id, options);
    message.insert("error_message".into(), json!(err.to_string()));
    message.insert("error_code".into(), json!(err.error_code()));
    match err {
        Error::FetchFailure {
            retries,
            response_time_ms,
            timeout_ms,
            max_retries,
            ..
        } => {
            message.insert("retries".into(), json!(retries));
            message.insert("responseTime".into(), json!(response_time_ms));
            message.insert("timeout".into(), json!(timeout_ms));
            message.insert("maxRetries".into(), json!(max_retries));
        }
        _ => {
            message.insert("timeout".into(), json!(options.timeout.as_millis() as u64));
        }
    }
    TelemetryEvent::new(TYPE_ADS, SUBTYPE_PREFETCH_FAILURE, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MemorySink, SUBTYPE_MISSED_AD};
    use crate::types::{AdDescriptor, FetchMetrics};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct StubFetcher {
        calls: AtomicUsize,
        outcome: Result<AdPodResponse>,
        delay: Duration,
    }

    #[async_trait]
    impl AdPodFetcher for StubFetcher {
        async fn fetch(&self, _request: &AdPodRequest) -> Result<AdPodResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    fn pod(durations: &[f64]) -> AdPod {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| AdDescriptor {
                id: format!("ad-{i}"),
                duration: *d,
                media_url: None,
            })
            .collect()
    }

    fn cache_with(outcome: Result<AdPodResponse>, delay: Duration) -> (AdPrefetchCache, MemorySink, Arc<StubFetcher>) {
        let sink = MemorySink::new();
        let fetcher = Arc::new(StubFetcher {
            calls: AtomicUsize::new(0),
            outcome,
            delay,
        });
        let cache = AdPrefetchCache::new(
            fetcher.clone(),
            Arc::new(sink.clone()),
            PendingOperationRegistry::new(),
        );
        (cache, sink, fetcher)
    }

    fn options(skip_error: bool) -> FetchAndCacheOptions {
        FetchAndCacheOptions {
            pre_request_from: PresetAdType::Preload,
            is_series: false,
            timeout: Duration::from_millis(500),
            skip_error,
        }
    }

    fn item(prefetch: Option<AdPrefetch>) -> AdCacheItem {
        AdCacheItem {
            ads_pre_fetch: prefetch,
            pre_request_from: PresetAdType::Selection,
            is_series: true,
        }
    }

    fn unused_cache() -> (AdPrefetchCache, MemorySink) {
        let (cache, sink, _) = cache_with(Ok(AdPodResponse::default()), Duration::ZERO);
        (cache, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_are_isolated() {
        let (cache, _sink) = unused_cache();
        cache.set_cache_item("A", item(Some(ready_prefetch(Some(pod(&[15.0]))))));
        cache.set_cache_item("B", item(None));

        let a = cache.get_cache_item("A").unwrap();
        assert_eq!(a.content_id, "A");
        assert!(a.ads_pre_fetch.is_some());
        assert!(cache.get_cache_item("B").unwrap().ads_pre_fetch.is_none());
        assert!(cache.get_cache_item("C").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_entry() {
        let (cache, _sink) = unused_cache();
        cache.set_cache_item("A", item(Some(ready_prefetch(Some(pod(&[15.0]))))));
        cache.set_cache_item("A", item(Some(ready_prefetch(Some(pod(&[15.0, 30.0]))))));

        assert_eq!(cache.len(), 1);
        let ads = cache.get_cache_item("A").unwrap().ads_pre_fetch.unwrap().await;
        assert_eq!(ads.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_reports_missed_ad_once() {
        let (cache, sink) = unused_cache();
        cache.set_cache_item("A", item(Some(ready_prefetch(Some(pod(&[15.0, 30.0]))))));
        cache.set_cache_item("B", item(Some(ready_prefetch(Some(pod(&[10.0]))))));

        assert_eq!(cache.clear(Some("B")), 1);
        assert!(cache.get_cache_item("A").is_none());
        assert!(cache.contains("B"));

        tokio::time::sleep(Duration::from_millis(1)).await;
        let missed = sink.events_of(SUBTYPE_MISSED_AD);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].field("content_id"), Some(&json!("A")));
        assert_eq!(missed[0].field("adCount"), Some(&json!(2)));
        assert_eq!(missed[0].field("totalAdDuration"), Some(&json!(45_000)));
        assert_eq!(missed[0].field("isSeries"), Some(&json!(true)));
        assert_eq!(missed[0].field("preRequestFrom"), Some(&json!("selection")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_without_prefetch_is_silent() {
        let (cache, sink) = unused_cache();
        cache.set_cache_item("A", item(None));
        assert_eq!(cache.clear(None), 1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sink.is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_waits_for_in_flight_fetch() {
        let (cache, sink) = unused_cache();
        let (tx, rx) = oneshot::channel::<AdPod>();
        let in_flight = async move { rx.await.ok() }.boxed().shared();
        cache.set_cache_item("A", item(Some(in_flight)));

        cache.clear(None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sink.is_empty());

        tx.send(pod(&[20.0])).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let missed = sink.events_of(SUBTYPE_MISSED_AD);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].field("totalAdDuration"), Some(&json!(20_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_and_cache_success() {
        let response = AdPodResponse {
            ads: pod(&[15.0, 15.0, 30.0]),
            metrics: FetchMetrics {
                response_time: 80,
                ..Default::default()
            },
        };
        let (cache, sink, fetcher) = cache_with(Ok(response), Duration::from_millis(50));

        let ads = cache.fetch_and_cache("movie-1", options(true)).await;
        assert_eq!(ads.unwrap().len(), 3);

        let success = sink.events_of(SUBTYPE_PREFETCH_SUCCESS);
        assert_eq!(success.len(), 1);
        assert_eq!(success[0].field("adCount"), Some(&json!(3)));
        assert_eq!(success[0].field("responseTime"), Some(&json!(80)));

        // Cached: a second call does not refetch
        cache.fetch_and_cache("movie-1", options(true)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_caches_empty_pod_with_skip_error() {
        let failure = Err(Error::FetchFailure {
            message: "503".into(),
            retries: 2,
            response_time_ms: 300,
            timeout_ms: 500,
            max_retries: 2,
        });
        let (cache, sink, fetcher) = cache_with(failure, Duration::from_millis(10));

        let ads = cache.fetch_and_cache("movie-2", options(true)).await;
        assert_eq!(ads, Some(Vec::new()));

        let failures = sink.events_of(SUBTYPE_PREFETCH_FAILURE);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field("retries"), Some(&json!(2)));
        assert_eq!(failures[0].field("maxRetries"), Some(&json!(2)));

        cache.fetch_and_cache("movie-2", options(true)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_caches_nothing_without_skip_error() {
        let (cache, sink, _) = cache_with(Ok(AdPodResponse::default()), Duration::from_secs(5));

        let ads = cache.fetch_and_cache("movie-3", options(false)).await;
        assert_eq!(ads, None);

        let failures = sink.events_of(SUBTYPE_PREFETCH_FAILURE);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field("error_code"), Some(&json!("TIMEOUT")));
        assert!(cache.contains("movie-3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_is_not_cancelled_by_clear() {
        let response = AdPodResponse {
            ads: pod(&[30.0]),
            metrics: FetchMetrics::default(),
        };
        let (cache, sink, fetcher) = cache_with(Ok(response), Duration::from_millis(100));

        let _prefetch = cache.fetch_and_cache("old", options(true));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.clear(Some("new"));
        assert!(cache.pending.is_empty());
        assert_eq!(cache.pending.abort_all(None), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.events_of(SUBTYPE_PREFETCH_SUCCESS).len(), 1);
        let missed = sink.events_of(SUBTYPE_MISSED_AD);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].field("adCount"), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_removes_entry() {
        let (cache, _sink) = unused_cache();
        cache.set_cache_item("A", item(None));
        assert!(cache.consume("A").is_some());
        assert!(cache.consume("A").is_none());
    }
}
