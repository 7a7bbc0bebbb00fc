//! Error reporting pipeline
//!
//! Raw player errors flow through:
//! - classification against the platform's predicates
//! - per-`<kind>:<code>` rate limiting, so bursts collapse into counts
//! - a `classified_error` telemetry event
//! - a broadcast to the UI layer when the classification is fatal

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};

use crate::classifier::{classify_or_unknown, ErrorClassification};
use crate::rate_limit::RateLimitedEventScheduler;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{Platform, RawError, ReliabilityConfig, SessionId};
use crate::Error;

/// Capacity of the fatal-error broadcast channel
const FATAL_CHANNEL_CAPACITY: usize = 16;

/// Fatal classification handed to UI subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct FatalError {
    pub session_id: SessionId,
    pub classification: ErrorClassification,
    pub raw: RawError,
    pub error: Error,
}

/// Classifies, rate-limits and reports raw errors
#[derive(Clone)]
pub struct ErrorReporter {
    session_id: SessionId,
    platform: Platform,
    stall_dwell: Duration,
    /// When false, classification and fatal broadcast still happen
    telemetry_enabled: bool,
    scheduler: RateLimitedEventScheduler,
    sink: Arc<dyn TelemetrySink>,
    content_id: Arc<Mutex<Option<String>>>,
    fatal_tx: broadcast::Sender<FatalError>,
}

impl ErrorReporter {
    pub fn new(
        session_id: SessionId,
        config: &ReliabilityConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let (fatal_tx, _) = broadcast::channel(FATAL_CHANNEL_CAPACITY);
        Self {
            session_id,
            platform: config.platform,
            stall_dwell: config.stall_dwell(),
            telemetry_enabled: config.telemetry_enabled,
            scheduler: RateLimitedEventScheduler::new(config.max_tokens, config.token_rate()),
            sink,
            content_id: Arc::new(Mutex::new(None)),
            fatal_tx,
        }
    }

    /// Rate-limit key for a classification
    pub fn report_key(classification: &ErrorClassification, raw: &RawError) -> String {
        let code = match raw.code {
            Some(code) => code.to_string(),
            None => raw.details.clone().unwrap_or_default(),
        };
        format!("{}:{}", classification.kind.code(), code)
    }

    /// Report one raw error and return how it was classified
    #[instrument(skip(self, raw), fields(session_id = %self.session_id))]
    pub fn report(&self, raw: RawError) -> ErrorClassification {
        let classification = classify_or_unknown(&raw, self.platform);
        debug!(
            kind = %classification.kind,
            fatal = classification.fatal,
            "Classified error"
        );

        if classification.fatal {
            let err = classification.to_error(&raw, self.stall_dwell);
            error!(code = err.error_code(), error = %err, "Fatal playback error");
            let fatal = FatalError {
                session_id: self.session_id,
                classification: classification.clone(),
                raw: raw.clone(),
                error: err,
            };
            if self.fatal_tx.send(fatal).is_err() {
                warn!(kind = %classification.kind, "Fatal error with no subscribers");
            }
        }

        if self.telemetry_enabled {
            let key = Self::report_key(&classification, &raw);
            let sink = self.sink.clone();
            let session_id = self.session_id;
            let content_id = self.content_id.lock().clone();
            let reported = classification.clone();
            self.scheduler.schedule(&key, move |count| {
                sink.send(TelemetryEvent::classified_error(
                    &reported,
                    &raw,
                    session_id,
                    content_id.as_deref(),
                    count,
                ));
            });
        }

        classification
    }

    /// Content id attached to subsequent reports
    pub fn set_content_id(&self, content_id: Option<&str>) {
        *self.content_id.lock() = content_id.map(str::to_string);
    }

    pub fn subscribe_fatal(&self) -> broadcast::Receiver<FatalError> {
        self.fatal_tx.subscribe()
    }

    /// Send any aggregated counts still waiting for a refill
    pub fn flush(&self) -> usize {
        self.scheduler.flush()
    }

    pub fn scheduler(&self) -> &RateLimitedEventScheduler {
        &self.scheduler
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}
