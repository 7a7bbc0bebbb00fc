//! Playback Session - owner of the session-scoped reliability objects
//!
//! Coordinates:
//! - Pending operation tracking and teardown
//! - Ad-pod prefetching for upcoming content
//! - Error classification and rate-limited reporting
//! - Startup stall detection per attached player
//! - Player lifecycle announcements

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::{
    ad_cache::{AdPodFetcher, AdPrefetch, AdPrefetchCache, FetchAndCacheOptions},
    adapter::MediaAdapter,
    broker::{Managers, PlayerKind, PlayerLifecycleBroker},
    emitter::Disposer,
    pending::PendingOperationRegistry,
    reporter::{ErrorReporter, FatalError},
    stall::{StallDetector, StallStrategy},
    telemetry::TelemetrySink,
    types::*,
    Error, Result,
};

/// Broker type used by sessions
pub type SessionBroker = PlayerLifecycleBroker<dyn MediaAdapter, Managers>;

/// Message attached to operations aborted by [`PlaybackSession::dispose`]
const DISPOSE_MESSAGE: &str = "Session disposed";

/// Session holding everything that must be torn down together
pub struct PlaybackSession {
    /// Unique session ID
    id: SessionId,
    /// Session configuration
    config: ReliabilityConfig,
    /// Strategy picked once from the platform
    stall_strategy: StallStrategy,
    /// Pending promise registry
    pending: PendingOperationRegistry,
    /// Ad-pod prefetch cache
    ad_cache: AdPrefetchCache,
    /// Error reporting pipeline
    reporter: ErrorReporter,
    /// Created on first use
    broker: OnceLock<SessionBroker>,
    /// Players currently attached
    players: Mutex<Vec<Arc<Attachment>>>,
    closed: AtomicBool,
}

impl PlaybackSession {
    /// Create a new session
    pub fn new(
        config: ReliabilityConfig,
        sink: Arc<dyn TelemetrySink>,
        fetcher: Arc<dyn AdPodFetcher>,
    ) -> Result<Self> {
        config.validate()?;

        let id = SessionId::new();
        let pending = PendingOperationRegistry::new();
        let ad_cache = AdPrefetchCache::new(fetcher, sink.clone(), pending.clone());
        let reporter = ErrorReporter::new(id, &config, sink);
        let stall_strategy = StallStrategy::for_platform(config.platform);

        info!(session_id = %id, platform = %config.platform, ?stall_strategy, "Session created");

        Ok(Self {
            id,
            config,
            stall_strategy,
            pending,
            ad_cache,
            reporter,
            broker: OnceLock::new(),
            players: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn stall_strategy(&self) -> StallStrategy {
        self.stall_strategy
    }

    pub fn pending(&self) -> &PendingOperationRegistry {
        &self.pending
    }

    pub fn ad_cache(&self) -> &AdPrefetchCache {
        &self.ad_cache
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Lifecycle broker, created on first access
    pub fn broker(&self) -> &SessionBroker {
        self.broker.get_or_init(|| {
            debug!(session_id = %self.id, "Creating lifecycle broker");
            SessionBroker::new()
        })
    }

    /// Subscribe to fatal classifications
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<FatalError> {
        self.reporter.subscribe_fatal()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start watching a player for startup stalls and forward its errors
    #[instrument(skip(self, adapter), fields(session_id = %self.id))]
    pub fn attach_player(&self, adapter: Arc<dyn MediaAdapter>) -> Result<AttachedPlayer> {
        if self.is_closed() {
            return Err(Error::aborted("attachPlayer", Some(DISPOSE_MESSAGE)));
        }

        let reporter = self.reporter.clone();
        let errors = adapter
            .events()
            .subscribe(MediaEventKind::Error, move |event| {
                if let MediaEvent::Error(raw) = event {
                    reporter.report(raw.clone());
                }
            });

        let detector = StallDetector::new(adapter, self.stall_strategy, self.config.stall_dwell());
        detector.attach();

        let attachment = Arc::new(Attachment {
            detector,
            errors,
            detached: AtomicBool::new(false),
        });
        {
            let mut players = self.players.lock();
            players.retain(|player| !player.detached.load(Ordering::SeqCst));
            players.push(attachment.clone());
        }

        info!(strategy = ?self.stall_strategy, "Player attached");
        Ok(AttachedPlayer { inner: attachment })
    }

    /// Announce a new player on the VOD or Live channel
    pub fn inject_player(
        &self,
        kind: PlayerKind,
        player: Arc<dyn MediaAdapter>,
        managers: Managers,
    ) -> usize {
        self.broker().channel(kind).inject(player, Arc::new(managers))
    }

    /// Prefetch the ad pod for `content_id` with the configured timeout
    pub fn prefetch_ads(
        &self,
        content_id: &str,
        pre_request_from: PresetAdType,
        is_series: bool,
    ) -> AdPrefetch {
        self.ad_cache.fetch_and_cache(
            content_id,
            FetchAndCacheOptions {
                pre_request_from,
                is_series,
                timeout: self.config.ad_fetch_timeout(),
                skip_error: self.config.ad_fetch_skip_error,
            },
        )
    }

    /// Switch playback to `content_id`
    ///
    /// Prefetches for any other content are evicted and reported as missed.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn switch_content(&self, content_id: &str) -> usize {
        self.reporter.set_content_id(Some(content_id));
        let evicted = self.ad_cache.clear(Some(content_id));
        info!(evicted, "Content switched");
        evicted
    }

    /// Tear the session down; later calls are no-ops
    ///
    /// Clears the ad cache first, so in-flight prefetches finish and are
    /// reported as missed ads instead of being aborted. Then aborts every
    /// pending operation, detaches every player and flushes outstanding
    /// error counts.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let evicted = self.ad_cache.clear(None);
        let aborted = self.pending.abort_all(Some(DISPOSE_MESSAGE));

        let players: Vec<_> = self.players.lock().drain(..).collect();
        for player in &players {
            player.detach();
        }
        let flushed = self.reporter.flush();

        info!(
            aborted,
            evicted,
            players = players.len(),
            flushed,
            "Session disposed"
        );
    }
}

struct Attachment {
    detector: StallDetector,
    errors: Disposer<MediaEventKind, MediaEvent>,
    detached: AtomicBool,
}

impl Attachment {
    fn detach(&self) -> bool {
        if self.detached.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.detector.destroy();
        self.errors.dispose();
        true
    }
}

/// A player wired into a session
#[derive(Clone)]
pub struct AttachedPlayer {
    inner: Arc<Attachment>,
}

impl AttachedPlayer {
    pub fn detector(&self) -> &StallDetector {
        &self.inner.detector
    }

    /// Stop stall detection and error forwarding for this player
    pub fn detach(&self) -> bool {
        let detached = self.inner.detach();
        if detached {
            debug!("Player detached");
        }
        detached
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad_cache::AdPodRequest;
    use crate::adapter::ScriptedAdapter;
    use crate::classifier::KEY_SYSTEM_ERROR;
    use crate::pending::StartOptions;
    use crate::stall::StallPhase;
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct EmptyFetcher;

    #[async_trait]
    impl AdPodFetcher for EmptyFetcher {
        async fn fetch(&self, _request: &AdPodRequest) -> Result<AdPodResponse> {
            Ok(AdPodResponse::default())
        }
    }

    /// Takes 200ms and counts fetches that ran to completion
    #[derive(Default)]
    struct SlowFetcher {
        completed: AtomicUsize,
    }

    #[async_trait]
    impl AdPodFetcher for SlowFetcher {
        async fn fetch(&self, _request: &AdPodRequest) -> Result<AdPodResponse> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(AdPodResponse {
                ads: vec![
                    AdDescriptor {
                        id: "mid-1".into(),
                        duration: 15.0,
                        media_url: None,
                    },
                    AdDescriptor {
                        id: "mid-2".into(),
                        duration: 30.0,
                        media_url: None,
                    },
                ],
                metrics: FetchMetrics::default(),
            })
        }
    }

    fn session(platform: Platform) -> (PlaybackSession, MemorySink) {
        let sink = MemorySink::new();
        let session = PlaybackSession::new(
            ReliabilityConfig::for_platform(platform),
            Arc::new(sink.clone()),
            Arc::new(EmptyFetcher),
        )
        .unwrap();
        (session, sink)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ReliabilityConfig {
            max_tokens: 0,
            ..Default::default()
        };
        let result = PlaybackSession::new(config, Arc::new(MemorySink::new()), Arc::new(EmptyFetcher));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_strategy_follows_platform() {
        let (lgtv, _) = session(Platform::Lgtv);
        assert_eq!(lgtv.stall_strategy(), StallStrategy::FragmentBuffered);
        let (web, _) = session(Platform::Web);
        assert_eq!(web.stall_strategy(), StallStrategy::Disabled);
    }

    #[tokio::test]
    async fn test_adapter_errors_are_reported() {
        let (session, sink) = session(Platform::Web);
        let adapter = ScriptedAdapter::new();
        let _player = session.attach_player(Arc::new(adapter.clone())).unwrap();

        adapter.emit(MediaEvent::Error(RawError::with_type(KEY_SYSTEM_ERROR)));
        assert_eq!(sink.events_of("drm").len(), 1);
    }

    #[tokio::test]
    async fn test_detach_stops_forwarding() {
        let (session, sink) = session(Platform::FireTvHyb);
        let adapter = ScriptedAdapter::new();
        let player = session.attach_player(Arc::new(adapter.clone())).unwrap();
        assert_eq!(adapter.events().listener_count(&MediaEventKind::Error), 1);

        assert!(player.detach());
        assert!(!player.detach());
        assert!(player.is_detached());
        assert_eq!(player.detector().phase(), StallPhase::Destroyed);
        assert_eq!(adapter.events().total_listener_count(), 0);

        adapter.emit(MediaEvent::Error(RawError::with_type(KEY_SYSTEM_ERROR)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (session, _) = session(Platform::FireTvHyb);
        let adapter = ScriptedAdapter::new();
        let player = session.attach_player(Arc::new(adapter.clone())).unwrap();
        let promise = session.pending().create_promise::<u32, _>(
            |_handle| None,
            StartOptions::new().handler_name("loadManifest"),
        );

        session.dispose();
        session.dispose();

        assert!(session.is_closed());
        assert!(session.pending().is_empty());
        assert!(player.is_detached());
        assert!(matches!(promise.await, Err(Error::Aborted { .. })));
        assert!(session.attach_player(Arc::new(adapter)).is_err());
    }

    #[tokio::test]
    async fn test_broker_is_lazy_and_shared() {
        let (session, _) = session(Platform::Web);
        let adapter: Arc<dyn MediaAdapter> = Arc::new(ScriptedAdapter::new());

        assert_eq!(session.inject_player(PlayerKind::Vod, adapter.clone(), Managers::new()), 0);
        let current = session.broker().vod().current().unwrap();
        assert!(Arc::ptr_eq(&current.player, &adapter));
        assert!(session.broker().live().current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_content_reports_missed_ads() {
        let (session, sink) = session(Platform::Web);
        session.prefetch_ads("a", PresetAdType::Preload, false).await;
        session.prefetch_ads("b", PresetAdType::Selection, true).await;

        assert_eq!(session.switch_content("b"), 1);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let missed = sink.events_of(crate::telemetry::SUBTYPE_MISSED_AD);
        assert_eq!(missed.len(), 1);
        assert!(session.ad_cache().contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_lets_in_flight_prefetch_finish() {
        let sink = MemorySink::new();
        let fetcher = Arc::new(SlowFetcher::default());
        let session = PlaybackSession::new(
            ReliabilityConfig::for_platform(Platform::Web),
            Arc::new(sink.clone()),
            fetcher.clone(),
        )
        .unwrap();

        let _prefetch = session.prefetch_ads("old", PresetAdType::Preload, false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.dispose();
        assert!(session.pending().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fetcher.completed.load(Ordering::SeqCst), 1);
        assert!(sink
            .events_of(crate::telemetry::SUBTYPE_PREFETCH_FAILURE)
            .is_empty());

        let missed = sink.events_of(crate::telemetry::SUBTYPE_MISSED_AD);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].field("content_id"), Some(&json!("old")));
        assert_eq!(missed[0].field("adCount"), Some(&json!(2)));
        assert_eq!(missed[0].field("totalAdDuration"), Some(&json!(45_000)));
    }
}
