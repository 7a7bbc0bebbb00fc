//! Playguard Core - Playback Reliability Library
//!
//! This crate provides the reliability layer that sits around a video player:
//! - Pending operation tracking with timeouts and bulk abort
//! - Token-bucket rate limiting of repeated error reports
//! - Platform-aware error classification
//! - Ad-pod prefetch caching with missed-ad telemetry
//! - Startup stall detection
//! - Player lifecycle broadcasting
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Playguard Core                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │    Media     │  │    Stall     │  │  Lifecycle   │           │
//! │  │   Adapter    ├──►   Detector   │  │    Broker    │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │ error           │ stall error     │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │  Playback   │                              │
//! │                    │   Session   │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │  Classifier  │◄─┤    Error    ├─►│  Rate Limit  │            │
//! │  │              │  │   Reporter  │  │  Scheduler   │            │
//! │  └──────────────┘  └──────┬──────┘  └──────────────┘            │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │   Pending    ├──►  Ad Prefetch├─►│  Telemetry   │            │
//! │  │  Operations  │  │    Cache    │  │    Sink      │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod timer;
pub mod emitter;
pub mod pending;
pub mod rate_limit;
pub mod classifier;
pub mod telemetry;
pub mod ad_cache;
pub mod adapter;
pub mod stall;
pub mod broker;
pub mod reporter;
pub mod session;

pub use error::{Error, Result};
pub use types::*;
pub use timer::CancellableTimer;
pub use emitter::{Disposer, EventEmitter};
pub use pending::{OperationHandle, PendingOperationRegistry, StartOptions, TrackedPromise};
pub use rate_limit::RateLimitedEventScheduler;
pub use classifier::{classify, classify_or_unknown, ErrorClassification, ErrorKind, MediaErrorKind};
pub use telemetry::{ChannelSink, MemorySink, TelemetryEvent, TelemetrySink, TracingSink};
pub use ad_cache::{AdPodFetcher, AdPodRequest, AdPrefetch, AdPrefetchCache, FetchAndCacheOptions};
pub use adapter::{MediaAdapter, ScriptedAdapter};
pub use stall::{StallDetector, StallPhase, StallStrategy};
pub use broker::{OnCreateWithCleanup, PlayerKind, PlayerLifecycleBroker};
pub use reporter::{ErrorReporter, FatalError};
pub use session::{AttachedPlayer, PlaybackSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Playguard Core initialized");
}

/// Install a formatted `tracing` subscriber filtered by `filter`
///
/// Returns false when a global subscriber was already installed.
pub fn init_logging(filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init()
        .is_ok()
}
