//! Token-bucket scheduler for noisy, repeated failure reports
//!
//! Each key owns an independent bucket holding up to `max_tokens` tokens.
//! A call that finds a token consumes it and runs the callback immediately
//! with a count of 1. A call that finds the bucket empty is only counted.
//!
//! While a bucket is below capacity a refill timer ticks every `token_rate`.
//! Each tick adds one token. If calls were suppressed since the last tick,
//! the new token is spent at once on a single aggregated callback carrying
//! the suppressed count. A bucket that is back at capacity with nothing
//! suppressed goes idle and is dropped, which is indistinguishable from a
//! fresh bucket.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::timer::CancellableTimer;

/// Report callback receiving the number of occurrences it stands for
pub type ReportCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Per-key bucket state
struct Bucket {
    tokens: u32,
    last_refill_at: Instant,
    suppressed_count: u32,
    callback: ReportCallback,
    pending_timer: Option<CancellableTimer>,
}

type Buckets = Mutex<HashMap<String, Bucket>>;

/// Token-bucket deduplication of repeated signals, keyed by string
#[derive(Clone)]
pub struct RateLimitedEventScheduler {
    max_tokens: u32,
    token_rate: Duration,
    buckets: Arc<Buckets>,
}

impl RateLimitedEventScheduler {
    pub fn new(max_tokens: u32, token_rate: Duration) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            token_rate,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `callback(1)` now if `key` has a token, otherwise count the call
    ///
    /// Suppressed calls are reported later as one `callback(n)` when the
    /// bucket refills. The most recent callback for a key is the one used.
    pub fn schedule<F>(&self, key: &str, callback: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let callback: ReportCallback = Arc::new(callback);
        let leading = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
                tokens: self.max_tokens,
                last_refill_at: Instant::now(),
                suppressed_count: 0,
                callback: callback.clone(),
                pending_timer: None,
            });
            bucket.callback = callback.clone();

            if bucket.tokens > 0 {
                bucket.tokens -= 1;
                if bucket.pending_timer.is_none() {
                    bucket.pending_timer = Some(self.arm(key));
                }
                true
            } else {
                bucket.suppressed_count += 1;
                trace!(key, suppressed = bucket.suppressed_count, "Event suppressed");
                false
            }
        };

        if leading {
            invoke(key, &callback, 1);
        }
    }

    fn arm(&self, key: &str) -> CancellableTimer {
        let buckets = Arc::downgrade(&self.buckets);
        let key = key.to_string();
        let max_tokens = self.max_tokens;
        let token_rate = self.token_rate;
        CancellableTimer::start(self.token_rate, move || {
            Self::refill(buckets, key, max_tokens, token_rate);
        })
    }

    fn refill(buckets: Weak<Buckets>, key: String, max_tokens: u32, token_rate: Duration) {
        let Some(strong) = buckets.upgrade() else {
            return;
        };

        let aggregate = {
            let mut map = strong.lock();
            let Some(bucket) = map.get_mut(&key) else {
                return;
            };
            bucket.pending_timer = None;
            bucket.tokens = (bucket.tokens + 1).min(max_tokens);
            bucket.last_refill_at = Instant::now();

            let rearm = || {
                let buckets = buckets.clone();
                let key = key.clone();
                CancellableTimer::start(token_rate, move || {
                    Self::refill(buckets, key, max_tokens, token_rate);
                })
            };

            if bucket.suppressed_count > 0 {
                let count = std::mem::take(&mut bucket.suppressed_count);
                bucket.tokens -= 1;
                bucket.pending_timer = Some(rearm());
                Some((bucket.callback.clone(), count))
            } else if bucket.tokens < max_tokens {
                bucket.pending_timer = Some(rearm());
                None
            } else {
                map.remove(&key);
                trace!(key = %key, "Bucket idle");
                None
            }
        };

        if let Some((callback, count)) = aggregate {
            debug!(key = %key, count, "Flushing suppressed events");
            invoke(&key, &callback, count);
        }
    }

    /// Report every pending aggregate now and drop all buckets
    pub fn flush(&self) -> usize {
        let pending: Vec<(String, ReportCallback, u32)> = {
            let mut buckets = self.buckets.lock();
            buckets
                .drain()
                .filter(|(_, bucket)| bucket.suppressed_count > 0)
                .map(|(key, bucket)| (key, bucket.callback.clone(), bucket.suppressed_count))
                .collect()
        };

        for (key, callback, count) in &pending {
            invoke(key, callback, *count);
        }
        pending.len()
    }

    pub fn suppressed_count(&self, key: &str) -> u32 {
        self.buckets
            .lock()
            .get(key)
            .map(|b| b.suppressed_count)
            .unwrap_or(0)
    }

    /// Tokens available for `key`; an unknown key has a full bucket
    pub fn available_tokens(&self, key: &str) -> u32 {
        self.buckets
            .lock()
            .get(key)
            .map(|b| b.tokens)
            .unwrap_or(self.max_tokens)
    }

    pub fn last_refill_at(&self, key: &str) -> Option<Instant> {
        self.buckets.lock().get(key).map(|b| b.last_refill_at)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl std::fmt::Debug for RateLimitedEventScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedEventScheduler")
            .field("max_tokens", &self.max_tokens)
            .field("token_rate", &self.token_rate)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

fn invoke(key: &str, callback: &ReportCallback, count: u32) {
    if catch_unwind(AssertUnwindSafe(|| callback(count))).is_err() {
        error!(key, count, "Rate-limited callback panicked");
    }
}
