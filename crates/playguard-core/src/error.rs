//! Error types for PlayGuard Core

use thiserror::Error;

use crate::classifier::MediaErrorKind;

/// Result type alias for reliability-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reliability-core error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Tracked operation errors
    #[error("Promise timeout {name}")]
    Timeout { name: String },

    #[error("{message}")]
    Aborted { message: String },

    // Ad pod errors
    #[error("Ad pod fetch failed: {message}")]
    FetchFailure {
        message: String,
        retries: u32,
        response_time_ms: u64,
        timeout_ms: u64,
        max_retries: u32,
    },

    // Playback errors
    #[error("Content startup stall detected after {dwell_ms}ms")]
    StallDetected { dwell_ms: u64 },

    #[error("Media error ({kind}): {message}")]
    Media { kind: MediaErrorKind, message: String },

    // Lifecycle errors
    #[error("on-create callback changed between bindings; pass a stable callback")]
    UnstableCallback,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build the abort error raised for a handler, falling back to the default message
    pub fn aborted(name: &str, message: Option<&str>) -> Self {
        let message = match message {
            Some(message) => message.to_string(),
            None if name.is_empty() => "Promise aborted".to_string(),
            None => format!("Promise aborted {name}"),
        };
        Error::Aborted { message }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Aborted { .. } | Error::FetchFailure { .. }
        )
    }

    /// Returns the error code for analytics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "TIMEOUT",
            Error::Aborted { .. } => "ABORTED",
            Error::FetchFailure { .. } => "FETCH_FAILURE",
            Error::StallDetected { .. } => "STALL_DETECTED",
            Error::Media { kind, .. } => kind.code(),
            Error::UnstableCallback => "UNSTABLE_CALLBACK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout { name: "adPrefetch".into() };
        assert_eq!(err.to_string(), "Promise timeout adPrefetch");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_abort_default_message() {
        assert_eq!(
            Error::aborted("drm", None).to_string(),
            "Promise aborted drm"
        );
        assert_eq!(Error::aborted("", None).to_string(), "Promise aborted");
        assert_eq!(
            Error::aborted("drm", Some("session closed")).to_string(),
            "session closed"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::StallDetected { dwell_ms: 5000 }.error_code(), "STALL_DETECTED");
        assert!(!Error::StallDetected { dwell_ms: 5000 }.is_recoverable());
        let media = Error::Media {
            kind: MediaErrorKind::Drm,
            message: "key system".into(),
        };
        assert_eq!(media.error_code(), "DRM_ERROR");
    }
}
