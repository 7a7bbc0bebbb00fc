//! Error classification
//!
//! Pure predicates mapping a [`RawError`] plus the running [`Platform`] onto a
//! canonical [`ErrorKind`]. Predicates are independent and may overlap;
//! [`classify`] applies them in a fixed priority order so exactly one kind
//! wins. Nothing here has side effects or state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ErrorSource, Platform, RawError};

/// `type` carried by key-system (DRM) failures
pub const KEY_SYSTEM_ERROR: &str = "KEY_SYSTEM_ERROR";
/// `type` used by synthetic and generic media failures
pub const MEDIA_ERROR: &str = "MEDIA_ERROR";
/// `details` marker of the synthetic startup-stall error
pub const CONTENT_STARTUP_STALL: &str = "CONTENT_STARTUP_STALL";

/// Key-status details that indicate an HDCP output restriction
pub const HDCP_DETAIL_CODES: [&str; 3] = [
    "KEY_STATUS_OUTPUT_RESTRICTED",
    "KEY_STATUS_OUTPUT_DOWNSCALED",
    "HDCP_VERSION_NOT_SUPPORTED",
];
/// Message emitted by older player builds for HDCP failures
pub const LEGACY_HDCP_MESSAGE: &str = "HDCP_INCOMPLIANCE";

/// Native decode message that FIRETV_HYB raises for DRM pipeline failures
pub const FIRETV_DRM_DECODE_MESSAGE: &str = "PIPELINE_ERROR_DECRYPT";

// HTML5 MediaError codes
const MEDIA_ERR_DECODE: i64 = 3;
const MEDIA_ERR_SRC_NOT_SUPPORTED: i64 = 4;
const MEDIA_ERR_ENCRYPTED: i64 = 5;

// Segmented-stream engine details
const DETAILS_INCOMPATIBLE_CODECS: &str = "manifestIncompatibleCodecsError";
const DETAILS_BUFFER_ADD_CODEC: &str = "bufferAddCodecError";
const DETAILS_LEVEL_LOAD_TIMEOUT: &str = "levelLoadTimeOut";
const DETAILS_FRAG_LOAD_ERROR: &str = "fragLoadError";

/// MediaError subdivision used by [`crate::Error::Media`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaErrorKind {
    Drm,
    Hdcp,
    Decode,
    SourceNotSupported,
    AutostartDenied,
    AbortedByBrowser,
    CodecIncompatible,
    LevelTimeout,
    FragLoadError,
    AudioDecoderInit,
    PlatformUnknown,
}

impl MediaErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            MediaErrorKind::Drm => "DRM_ERROR",
            MediaErrorKind::Hdcp => "HDCP_INCOMPLIANCE",
            MediaErrorKind::Decode => "DECODE_ERROR",
            MediaErrorKind::SourceNotSupported => "SOURCE_NOT_SUPPORTED",
            MediaErrorKind::AutostartDenied => "AUTOSTART_DENIED",
            MediaErrorKind::AbortedByBrowser => "ABORTED_BY_BROWSER",
            MediaErrorKind::CodecIncompatible => "CODEC_INCOMPATIBLE",
            MediaErrorKind::LevelTimeout => "LEVEL_TIMEOUT",
            MediaErrorKind::FragLoadError => "FRAG_LOAD_ERROR",
            MediaErrorKind::AudioDecoderInit => "AUDIO_DECODER_INIT",
            MediaErrorKind::PlatformUnknown => "PLATFORM_UNKNOWN",
        }
    }
}

impl std::fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Canonical error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Drm,
    HdcpIncompliance,
    InvalidCharacter,
    ContentStartupStall,
    Decode,
    SourceNotSupported,
    AutostartNotAllowed,
    DomAbortContent,
    DomAbortAd,
    UnknownNative,
    HlsExtensionCodec,
    LevelLoadTimeout,
    FragLoadError,
    AudioDecoderInit,
    /// Nothing matched
    Unknown,
}

impl ErrorKind {
    /// Stable code used in telemetry and rate-limit keys
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Drm => "drm",
            ErrorKind::HdcpIncompliance => "hdcp_incompliance",
            ErrorKind::InvalidCharacter => "invalid_character",
            ErrorKind::ContentStartupStall => "content_startup_stall",
            ErrorKind::Decode => "decode",
            ErrorKind::SourceNotSupported => "source_not_supported",
            ErrorKind::AutostartNotAllowed => "autostart_not_allowed",
            ErrorKind::DomAbortContent => "dom_abort_content",
            ErrorKind::DomAbortAd => "dom_abort_ad",
            ErrorKind::UnknownNative => "unknown_native",
            ErrorKind::HlsExtensionCodec => "hls_extension_codec",
            ErrorKind::LevelLoadTimeout => "level_load_timeout",
            ErrorKind::FragLoadError => "frag_load_error",
            ErrorKind::AudioDecoderInit => "audio_decoder_init",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Fatality when the raw payload does not say
    pub fn is_fatal_by_default(&self) -> bool {
        !matches!(
            self,
            ErrorKind::AutostartNotAllowed
                | ErrorKind::DomAbortContent
                | ErrorKind::DomAbortAd
                | ErrorKind::LevelLoadTimeout
                | ErrorKind::FragLoadError
                | ErrorKind::Unknown
        )
    }

    pub fn media_kind(&self) -> Option<MediaErrorKind> {
        match self {
            ErrorKind::Drm | ErrorKind::InvalidCharacter => Some(MediaErrorKind::Drm),
            ErrorKind::HdcpIncompliance => Some(MediaErrorKind::Hdcp),
            ErrorKind::Decode => Some(MediaErrorKind::Decode),
            ErrorKind::SourceNotSupported => Some(MediaErrorKind::SourceNotSupported),
            ErrorKind::AutostartNotAllowed => Some(MediaErrorKind::AutostartDenied),
            ErrorKind::DomAbortContent | ErrorKind::DomAbortAd => {
                Some(MediaErrorKind::AbortedByBrowser)
            }
            ErrorKind::HlsExtensionCodec => Some(MediaErrorKind::CodecIncompatible),
            ErrorKind::LevelLoadTimeout => Some(MediaErrorKind::LevelTimeout),
            ErrorKind::FragLoadError => Some(MediaErrorKind::FragLoadError),
            ErrorKind::AudioDecoderInit => Some(MediaErrorKind::AudioDecoderInit),
            ErrorKind::UnknownNative => Some(MediaErrorKind::PlatformUnknown),
            ErrorKind::ContentStartupStall | ErrorKind::Unknown => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of classifying one raw error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorClassification {
    /// Typed error for this classification
    ///
    /// `stall_dwell` is the dwell the startup stall detector was armed with.
    /// It is only read for startup stalls.
    pub fn to_error(&self, raw: &RawError, stall_dwell: Duration) -> crate::Error {
        let message = raw.message_str().to_string();
        match (self.kind, self.kind.media_kind()) {
            (ErrorKind::ContentStartupStall, _) => crate::Error::StallDetected {
                dwell_ms: u64::try_from(stall_dwell.as_millis()).unwrap_or(u64::MAX),
            },
            (_, Some(kind)) => crate::Error::Media { kind, message },
            (_, None) => crate::Error::Internal(message),
        }
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// Signature shared by every predicate
pub type Predicate = fn(&RawError, Platform) -> bool;

fn message_contains(raw: &RawError, needle: &str) -> bool {
    raw.message_str().contains(needle)
}

pub fn is_drm_error(raw: &RawError, platform: Platform) -> bool {
    if raw.type_str() == KEY_SYSTEM_ERROR || raw.code == Some(MEDIA_ERR_ENCRYPTED) {
        return true;
    }
    match platform {
        // XBOXONE surfaces key-system failures as an empty object
        Platform::XboxOne => raw.is_empty(),
        Platform::FireTvHyb => is_firetv_drm_decode(raw),
        _ => false,
    }
}

fn is_firetv_drm_decode(raw: &RawError) -> bool {
    raw.code == Some(MEDIA_ERR_DECODE) && message_contains(raw, FIRETV_DRM_DECODE_MESSAGE)
}

pub fn is_hdcp_incompliance_error(raw: &RawError, _platform: Platform) -> bool {
    HDCP_DETAIL_CODES.contains(&raw.details_str()) || raw.message_str() == LEGACY_HDCP_MESSAGE
}

pub fn is_invalid_character_error(raw: &RawError, _platform: Platform) -> bool {
    raw.name_str() == "InvalidCharacterError" || message_contains(raw, "InvalidCharacterError")
}

pub fn is_content_startup_stall_error(raw: &RawError, _platform: Platform) -> bool {
    raw.details_str() == CONTENT_STARTUP_STALL
}

pub fn is_decode_error(raw: &RawError, platform: Platform) -> bool {
    if platform == Platform::FireTvHyb && is_firetv_drm_decode(raw) {
        return false;
    }
    raw.code == Some(MEDIA_ERR_DECODE) || raw.type_str() == "MEDIA_ERR_DECODE"
}

pub fn is_source_not_supported_error(raw: &RawError, _platform: Platform) -> bool {
    raw.code == Some(MEDIA_ERR_SRC_NOT_SUPPORTED)
        || raw.type_str() == "MEDIA_ERR_SRC_NOT_SUPPORTED"
        || raw.name_str() == "NotSupportedError"
}

pub fn is_autostart_not_allowed_error(raw: &RawError, _platform: Platform) -> bool {
    raw.name_str() == "NotAllowedError"
}

fn is_dom_abort(raw: &RawError) -> bool {
    raw.name_str() == "AbortError"
}

pub fn is_content_dom_abort_error(raw: &RawError, _platform: Platform) -> bool {
    is_dom_abort(raw) && raw.error_source != Some(ErrorSource::Ad)
}

pub fn is_ad_dom_abort_error(raw: &RawError, _platform: Platform) -> bool {
    is_dom_abort(raw) && raw.error_source == Some(ErrorSource::Ad)
}

/// Smart-TV native players report some failures with no code and no message
pub fn is_unknown_native_error(raw: &RawError, platform: Platform) -> bool {
    platform.has_opaque_native_errors()
        && raw.error_source == Some(ErrorSource::Native)
        && matches!(raw.code, None | Some(0))
        && raw.message_str().trim().is_empty()
}

pub fn is_hls_extension_codec_error(raw: &RawError, _platform: Platform) -> bool {
    matches!(
        raw.details_str(),
        DETAILS_INCOMPATIBLE_CODECS | DETAILS_BUFFER_ADD_CODEC
    )
}

pub fn is_level_load_timeout(raw: &RawError, _platform: Platform) -> bool {
    raw.details_str() == DETAILS_LEVEL_LOAD_TIMEOUT
}

pub fn is_frag_load_error(raw: &RawError, _platform: Platform) -> bool {
    raw.details_str() == DETAILS_FRAG_LOAD_ERROR
}

pub fn is_audio_decoder_init_error(raw: &RawError, _platform: Platform) -> bool {
    let message = raw.message_str().to_ascii_lowercase();
    message.contains("audio decoder") && message.contains("init")
}

// =============================================================================
// Policy
// =============================================================================

/// Predicates in the order [`classify`] tries them
///
/// HDCP precedes DRM because HDCP failures also arrive as key-system errors.
/// The startup stall marker is checked first since it is authoritative.
pub const CLASSIFICATION_ORDER: [(ErrorKind, Predicate); 14] = [
    (ErrorKind::ContentStartupStall, is_content_startup_stall_error),
    (ErrorKind::HdcpIncompliance, is_hdcp_incompliance_error),
    (ErrorKind::Drm, is_drm_error),
    (ErrorKind::InvalidCharacter, is_invalid_character_error),
    (ErrorKind::AutostartNotAllowed, is_autostart_not_allowed_error),
    (ErrorKind::DomAbortAd, is_ad_dom_abort_error),
    (ErrorKind::DomAbortContent, is_content_dom_abort_error),
    (ErrorKind::HlsExtensionCodec, is_hls_extension_codec_error),
    (ErrorKind::AudioDecoderInit, is_audio_decoder_init_error),
    (ErrorKind::Decode, is_decode_error),
    (ErrorKind::SourceNotSupported, is_source_not_supported_error),
    (ErrorKind::LevelLoadTimeout, is_level_load_timeout),
    (ErrorKind::FragLoadError, is_frag_load_error),
    (ErrorKind::UnknownNative, is_unknown_native_error),
];

/// Classify a raw error; returns `None` when no predicate matches
pub fn classify(raw: &RawError, platform: Platform) -> Option<ErrorClassification> {
    let (kind, _) = CLASSIFICATION_ORDER
        .iter()
        .find(|(_, predicate)| predicate(raw, platform))?;

    let fatal = match kind {
        ErrorKind::ContentStartupStall => true,
        _ => raw.fatal.unwrap_or_else(|| kind.is_fatal_by_default()),
    };
    let detail = raw
        .details
        .clone()
        .or_else(|| raw.message.clone())
        .filter(|d| !d.is_empty());

    Some(ErrorClassification {
        kind: *kind,
        fatal,
        detail,
    })
}

/// Like [`classify`], but falls back to a non-fatal [`ErrorKind::Unknown`]
pub fn classify_or_unknown(raw: &RawError, platform: Platform) -> ErrorClassification {
    classify(raw, platform).unwrap_or_else(|| ErrorClassification {
        kind: ErrorKind::Unknown,
        fatal: raw.fatal.unwrap_or(false),
        detail: raw.details.clone().or_else(|| raw.message.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_PLATFORMS: [Platform; 7] = [
        Platform::Web,
        Platform::FireTvHyb,
        Platform::Lgtv,
        Platform::Tizen,
        Platform::XboxOne,
        Platform::Vizio,
        Platform::Comcast,
    ];

    #[test]
    fn test_key_system_error_is_drm_everywhere() {
        let raw = RawError::with_type(KEY_SYSTEM_ERROR);
        for platform in ALL_PLATFORMS {
            assert!(is_drm_error(&raw, platform), "{platform}");
        }
    }

    #[test]
    fn test_xbox_empty_error_is_drm() {
        let raw = RawError::default();
        assert!(is_drm_error(&raw, Platform::XboxOne));
        assert!(!is_drm_error(&raw, Platform::Web));
        assert_eq!(
            classify(&raw, Platform::XboxOne).map(|c| c.kind),
            Some(ErrorKind::Drm)
        );
    }

    #[test]
    fn test_firetv_decrypt_decode_is_drm_not_decode() {
        let raw = RawError::default()
            .with_code(3)
            .with_message("PIPELINE_ERROR_DECRYPT: key not usable");

        assert!(is_drm_error(&raw, Platform::FireTvHyb));
        assert!(!is_decode_error(&raw, Platform::FireTvHyb));
        assert!(is_decode_error(&raw, Platform::Web));
        assert!(!is_drm_error(&raw, Platform::Web));
    }

    #[test]
    fn test_hdcp_only_for_enumerated_codes() {
        for code in HDCP_DETAIL_CODES {
            let raw = RawError::with_type(KEY_SYSTEM_ERROR).with_details(code);
            assert!(is_hdcp_incompliance_error(&raw, Platform::Web));
            assert_eq!(
                classify(&raw, Platform::Web).unwrap().kind,
                ErrorKind::HdcpIncompliance
            );
        }

        let legacy = RawError::default().with_message(LEGACY_HDCP_MESSAGE);
        assert!(is_hdcp_incompliance_error(&legacy, Platform::Lgtv));

        let other = RawError::with_type(KEY_SYSTEM_ERROR).with_details("keySystemNoKeys");
        assert!(!is_hdcp_incompliance_error(&other, Platform::Web));
        let near_miss = RawError::default().with_message("HDCP_INCOMPLIANCE detected");
        assert!(!is_hdcp_incompliance_error(&near_miss, Platform::Web));
    }

    #[test]
    fn test_dom_abort_variants() {
        let content = RawError::default()
            .with_name("AbortError")
            .with_source(ErrorSource::Native);
        let ad = RawError::default()
            .with_name("AbortError")
            .with_source(ErrorSource::Ad);

        assert!(is_content_dom_abort_error(&content, Platform::Web));
        assert!(!is_ad_dom_abort_error(&content, Platform::Web));
        assert!(is_ad_dom_abort_error(&ad, Platform::Web));
        assert!(!is_content_dom_abort_error(&ad, Platform::Web));

        let classified = classify(&ad, Platform::Web).unwrap();
        assert_eq!(classified.kind, ErrorKind::DomAbortAd);
        assert!(!classified.fatal);
    }

    #[test]
    fn test_unknown_native_is_platform_specific() {
        let raw = RawError::default().with_source(ErrorSource::Native).with_code(0);
        assert!(is_unknown_native_error(&raw, Platform::Lgtv));
        assert!(is_unknown_native_error(&raw, Platform::Tizen));
        assert!(!is_unknown_native_error(&raw, Platform::Web));

        let with_message = raw.clone().with_message("network");
        assert!(!is_unknown_native_error(&with_message, Platform::Lgtv));
    }

    #[test]
    fn test_hls_details_predicates() {
        let codec = RawError::with_type(MEDIA_ERROR).with_details("manifestIncompatibleCodecsError");
        let level = RawError::with_type("NETWORK_ERROR").with_details("levelLoadTimeOut");
        let frag = RawError::with_type("NETWORK_ERROR").with_details("fragLoadError");

        assert!(is_hls_extension_codec_error(&codec, Platform::Web));
        assert!(is_level_load_timeout(&level, Platform::Web));
        assert!(is_frag_load_error(&frag, Platform::Web));
        assert!(!is_frag_load_error(&level, Platform::Web));

        let classified = classify(&level, Platform::Web).unwrap();
        assert_eq!(classified.kind, ErrorKind::LevelLoadTimeout);
        assert!(!classified.fatal);
        assert_eq!(classified.detail.as_deref(), Some("levelLoadTimeOut"));
    }

    #[test]
    fn test_misc_predicates() {
        let autoplay = RawError::default().with_name("NotAllowedError");
        assert!(is_autostart_not_allowed_error(&autoplay, Platform::Web));

        let atob = RawError::default().with_message("InvalidCharacterError: bad base64");
        assert!(is_invalid_character_error(&atob, Platform::Web));

        let src = RawError::default().with_code(4);
        assert!(is_source_not_supported_error(&src, Platform::Web));

        let audio = RawError::default().with_message("Audio decoder initialization failed");
        assert!(is_audio_decoder_init_error(&audio, Platform::Web));
        assert_eq!(
            classify(&audio, Platform::Web).unwrap().kind,
            ErrorKind::AudioDecoderInit
        );
    }

    #[test]
    fn test_stall_marker_always_fatal() {
        let raw = RawError::with_type(MEDIA_ERROR)
            .with_details(CONTENT_STARTUP_STALL)
            .with_fatal(false);
        let classified = classify(&raw, Platform::FireTvHyb).unwrap();
        assert_eq!(classified.kind, ErrorKind::ContentStartupStall);
        assert!(classified.fatal);
    }

    #[test]
    fn test_explicit_fatal_flag_wins() {
        let raw = RawError::with_type("NETWORK_ERROR")
            .with_details("fragLoadError")
            .with_fatal(true);
        assert!(classify(&raw, Platform::Web).unwrap().fatal);
    }

    #[test]
    fn test_unclassified() {
        let raw = RawError::with_type("OTHER_ERROR").with_message("whatever");
        assert!(classify(&raw, Platform::Web).is_none());
        let fallback = classify_or_unknown(&raw, Platform::Web);
        assert_eq!(fallback.kind, ErrorKind::Unknown);
        assert!(!fallback.fatal);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let raw = RawError::with_type(KEY_SYSTEM_ERROR).with_details("keySystemNoSession");
        let first = classify(&raw, Platform::Comcast);
        for _ in 0..10 {
            assert_eq!(classify(&raw, Platform::Comcast), first);
        }
    }

    #[test]
    fn test_media_kind_mapping() {
        assert_eq!(ErrorKind::Drm.media_kind(), Some(MediaErrorKind::Drm));
        assert_eq!(ErrorKind::ContentStartupStall.media_kind(), None);
        let decode = ErrorClassification {
            kind: ErrorKind::Decode,
            fatal: true,
            detail: None,
        };
        let err = decode.to_error(
            &RawError::default().with_message("decode failed"),
            Duration::from_secs(5),
        );
        assert_eq!(err.error_code(), "DECODE_ERROR");
        assert_eq!(err.to_string(), "Media error (DECODE_ERROR): decode failed");
    }

    #[test]
    fn test_stall_error_carries_dwell() {
        let raw = crate::stall::stall_error(Duration::from_millis(7_500));
        let classification = classify(&raw, Platform::FireTvHyb).unwrap();
        let err = classification.to_error(&raw, Duration::from_millis(7_500));

        assert_eq!(err, crate::Error::StallDetected { dwell_ms: 7_500 });
        assert!(err.to_string().contains("7500ms"));
    }
}
