//! Telemetry event emission
//!
//! Captures reliability signals for:
//! - Classified playback errors
//! - Ad prefetch success, failure and loss
//! - Aggregated counts of rate-limited duplicates

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::ErrorClassification;
use crate::types::{PresetAdType, RawError, SessionId};

pub const TYPE_ERROR: &str = "error";
pub const TYPE_ADS: &str = "ads";
pub const SUBTYPE_MISSED_AD: &str = "missed_ad";
pub const SUBTYPE_PREFETCH_SUCCESS: &str = "prefetch_success";
pub const SUBTYPE_PREFETCH_FAILURE: &str = "prefetch_failure";

/// Structured event handed to the telemetry sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Unique event ID
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub subtype: String,
    /// Flat record of event fields
    pub message: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(event_type: &str, subtype: &str, message: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            subtype: subtype.to_string(),
            message,
            timestamp: Utc::now(),
        }
    }

    /// Classified playback error, with the number of occurrences it stands for
    pub fn classified_error(
        classification: &ErrorClassification,
        raw: &RawError,
        session_id: SessionId,
        content_id: Option<&str>,
        suppressed_count: u32,
    ) -> Self {
        let mut message = Map::new();
        message.insert(
            "error_code".into(),
            match raw.code {
                Some(code) => json!(code),
                None => json!(classification.kind.code()),
            },
        );
        message.insert(
            "error_message".into(),
            json!(raw.message.clone().unwrap_or_default()),
        );
        message.insert("error_kind".into(), json!(classification.kind.code()));
        message.insert("fatal".into(), json!(classification.fatal));
        if let Some(detail) = &classification.detail {
            message.insert("error_detail".into(), json!(detail));
        }
        message.insert("session_id".into(), json!(session_id.to_string()));
        if let Some(content_id) = content_id {
            message.insert("content_id".into(), json!(content_id));
        }
        message.insert("suppressed_count".into(), json!(suppressed_count));
        Self::new(TYPE_ERROR, classification.kind.code(), message)
    }

    /// Ad pod whose prefetch outlived its content id
    pub fn missed_ad(
        content_id: &str,
        pre_request_from: PresetAdType,
        ad_count: usize,
        is_series: bool,
        total_ad_duration_ms: u64,
    ) -> Self {
        let mut message = Map::new();
        message.insert("content_id".into(), json!(content_id));
        message.insert("preRequestFrom".into(), json!(pre_request_from.to_string()));
        message.insert("adCount".into(), json!(ad_count));
        message.insert("isSeries".into(), json!(is_series));
        message.insert("totalAdDuration".into(), json!(total_ad_duration_ms));
        Self::new(TYPE_ADS, SUBTYPE_MISSED_AD, message)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.message.get(name)
    }
}

/// Destination for telemetry events
pub trait TelemetrySink: Send + Sync {
    fn send(&self, event: TelemetryEvent);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn send(&self, event: TelemetryEvent) {
        let message = Value::Object(event.message.clone());
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            subtype = %event.subtype,
            message = %message,
            "Telemetry event"
        );
    }
}

/// Sink that forwards events to a background task
pub struct ChannelSink {
    event_tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    /// Spawn a background task feeding every event to `forward`
    pub fn spawn<F>(capacity: usize, forward: F) -> Self
    where
        F: Fn(TelemetryEvent) + Send + 'static,
    {
        let (event_tx, mut event_rx) = mpsc::channel::<TelemetryEvent>(capacity);

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(event_id = %event.id, subtype = %event.subtype, "Forwarding telemetry event");
                forward(event);
            }
        });

        Self { event_tx }
    }

    pub fn from_sender(event_tx: mpsc::Sender<TelemetryEvent>) -> Self {
        Self { event_tx }
    }
}

impl TelemetrySink for ChannelSink {
    fn send(&self, event: TelemetryEvent) {
        if let Err(err) = self.event_tx.try_send(event) {
            warn!(error = %err, "Dropping telemetry event");
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Events with the given subtype
    pub fn events_of(&self, subtype: &str) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.subtype == subtype)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for MemorySink {
    fn send(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
