//! Core types for PlayGuard

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::{Error, Result};

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Platform
// =============================================================================

/// Device family the player is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Platform {
    #[default]
    #[serde(rename = "WEB")]
    Web,
    #[serde(rename = "FIRETV_HYB")]
    FireTvHyb,
    #[serde(rename = "LGTV")]
    Lgtv,
    #[serde(rename = "TIZEN")]
    Tizen,
    #[serde(rename = "XBOXONE")]
    XboxOne,
    #[serde(rename = "VIZIO")]
    Vizio,
    #[serde(rename = "COMCAST")]
    Comcast,
}

impl Platform {
    /// Smart TV families whose native players report errors without a code
    pub fn has_opaque_native_errors(&self) -> bool {
        matches!(self, Platform::Lgtv | Platform::Tizen | Platform::Vizio)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Web => write!(f, "WEB"),
            Platform::FireTvHyb => write!(f, "FIRETV_HYB"),
            Platform::Lgtv => write!(f, "LGTV"),
            Platform::Tizen => write!(f, "TIZEN"),
            Platform::XboxOne => write!(f, "XBOXONE"),
            Platform::Vizio => write!(f, "VIZIO"),
            Platform::Comcast => write!(f, "COMCAST"),
        }
    }
}

// =============================================================================
// Raw Error Payload
// =============================================================================

/// Layer of the playback stack that raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// The segmented-stream engine (HLS extension)
    Hls,
    /// The platform's native media element
    Native,
    /// The ad playback path
    Ad,
    /// Synthesized by this crate
    Synthetic,
}

/// HTTP response attached to a loader error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: Option<u16>,
    pub text: Option<String>,
}

/// Normalized low-level error payload from the player or adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// DOM exception name (e.g. `AbortError`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(
        rename = "errorSource",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_source: Option<ErrorSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ErrorResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<bool>,
}

impl RawError {
    pub fn with_type(error_type: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type.into()),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_source(mut self, source: ErrorSource) -> Self {
        self.error_source = Some(source);
        self
    }

    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// True when the payload carries no information (serializes to `{}`)
    pub fn is_empty(&self) -> bool {
        *self == RawError::default()
    }

    pub fn message_str(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    pub fn details_str(&self) -> &str {
        self.details.as_deref().unwrap_or("")
    }

    pub fn type_str(&self) -> &str {
        self.error_type.as_deref().unwrap_or("")
    }

    pub fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

// =============================================================================
// Media Adapter Events
// =============================================================================

/// Fragment type reported by the segmented-stream engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragType {
    Main,
    Audio,
    Subtitle,
}

/// Elementary track a buffered fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Event names the media adapter emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaEventKind {
    #[serde(rename = "FRAG_LOADED")]
    FragLoaded,
    #[serde(rename = "FRAG_BUFFERED")]
    FragBuffered,
    #[serde(rename = "loadeddata")]
    LoadedData,
    #[serde(rename = "error")]
    Error,
}

/// Low-level event emitted by the media adapter
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    FragLoaded { frag_type: FragType },
    FragBuffered { track: TrackKind },
    LoadedData,
    Error(RawError),
}

impl MediaEvent {
    pub fn kind(&self) -> MediaEventKind {
        match self {
            MediaEvent::FragLoaded { .. } => MediaEventKind::FragLoaded,
            MediaEvent::FragBuffered { .. } => MediaEventKind::FragBuffered,
            MediaEvent::LoadedData => MediaEventKind::LoadedData,
            MediaEvent::Error(_) => MediaEventKind::Error,
        }
    }
}

/// Snapshot of decoder progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPlaybackQuality {
    pub total_video_frames: u64,
    pub dropped_video_frames: u64,
}

// =============================================================================
// Ad Pod Types
// =============================================================================

/// Why an ad prefetch was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetAdType {
    /// Preloaded automatically ahead of playback
    Preload,
    /// Requested after an explicit title selection
    Selection,
    /// Requested for the next episode during autoplay
    Autoplay,
}

impl std::fmt::Display for PresetAdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresetAdType::Preload => write!(f, "preload"),
            PresetAdType::Selection => write!(f, "selection"),
            PresetAdType::Autoplay => write!(f, "autoplay"),
        }
    }
}

/// A single ad in a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdDescriptor {
    pub id: String,
    /// Duration in seconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

/// Ordered group of ads played back-to-back at one cue point
pub type AdPod = Vec<AdDescriptor>;

/// Total pod duration in milliseconds
pub fn total_ad_duration_ms(ads: &[AdDescriptor]) -> u64 {
    ads.iter()
        .map(|ad| (ad.duration.max(0.0) * 1000.0).round() as u64)
        .sum()
}

/// Timing metrics reported by the ad-pod endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMetrics {
    pub response_time: u64,
    pub network_response_time: u64,
    pub request_queue_time: u64,
    pub retries: u32,
    pub timeout: u64,
    pub max_retries: u32,
}

/// Ad-pod endpoint payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdPodResponse {
    pub ads: AdPod,
    #[serde(default)]
    pub metrics: FetchMetrics,
}

// =============================================================================
// Configuration
// =============================================================================

/// Session-wide reliability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Running platform
    pub platform: Platform,
    /// Tokens per rate-limit bucket
    pub max_tokens: u32,
    /// Token refill interval in milliseconds
    pub token_rate_ms: u64,
    /// Dwell before a startup stall is declared (milliseconds)
    pub stall_dwell_ms: u64,
    /// Ad-pod fetch timeout in milliseconds
    pub ad_fetch_timeout_ms: u64,
    /// Cache an empty pod instead of nothing when a fetch fails
    pub ad_fetch_skip_error: bool,
    /// Forward telemetry to the sink
    pub telemetry_enabled: bool,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Web,
            max_tokens: 1,
            token_rate_ms: 1000,
            stall_dwell_ms: 5000,
            ad_fetch_timeout_ms: 10_000,
            ad_fetch_skip_error: true,
            telemetry_enabled: true,
        }
    }
}

impl ReliabilityConfig {
    /// Parse from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::InvalidConfig("max_tokens must be at least 1".into()));
        }
        if self.token_rate_ms == 0 {
            return Err(Error::InvalidConfig("token_rate_ms must be non-zero".into()));
        }
        if self.stall_dwell_ms == 0 {
            return Err(Error::InvalidConfig("stall_dwell_ms must be non-zero".into()));
        }
        if self.ad_fetch_timeout_ms == 0 {
            return Err(Error::InvalidConfig("ad_fetch_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn token_rate(&self) -> Duration {
        Duration::from_millis(self.token_rate_ms)
    }

    pub fn stall_dwell(&self) -> Duration {
        Duration::from_millis(self.stall_dwell_ms)
    }

    pub fn ad_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.ad_fetch_timeout_ms)
    }
}
