//! Media/player adapter seam
//!
//! The adapter wraps the platform player. It emits low-level events
//! (`FRAG_LOADED`, `FRAG_BUFFERED`, `loadeddata`, `error`) and answers the
//! progress queries the stall detector uses to rule out false positives.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::emitter::EventEmitter;
use crate::types::{MediaEvent, MediaEventKind, VideoPlaybackQuality};

/// Emitter carrying adapter events
pub type MediaEvents = EventEmitter<MediaEventKind, MediaEvent>;

/// Platform player collaborator
pub trait MediaAdapter: Send + Sync {
    fn events(&self) -> &MediaEvents;

    fn is_current_time_video_buffered(&self) -> bool;

    /// `None` when the platform cannot report decoder progress
    fn video_playback_quality(&self) -> Option<VideoPlaybackQuality>;

    fn has_audio_track(&self) -> bool;

    /// Dispatch `event` to every subscriber of its kind
    fn emit(&self, event: MediaEvent) -> usize {
        self.events().emit(&event.kind(), &event)
    }
}

/// Adapter whose state is set by hand, for hosts without a real player
#[derive(Clone)]
pub struct ScriptedAdapter {
    events: MediaEvents,
    buffered: Arc<AtomicBool>,
    has_audio: Arc<AtomicBool>,
    quality: Arc<Mutex<Option<VideoPlaybackQuality>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            events: MediaEvents::new(),
            buffered: Arc::new(AtomicBool::new(false)),
            has_audio: Arc::new(AtomicBool::new(true)),
            quality: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_buffered(&self, buffered: bool) {
        self.buffered.store(buffered, Ordering::SeqCst);
    }

    pub fn set_has_audio(&self, has_audio: bool) {
        self.has_audio.store(has_audio, Ordering::SeqCst);
    }

    pub fn set_total_frames(&self, total_video_frames: u64) {
        *self.quality.lock() = Some(VideoPlaybackQuality {
            total_video_frames,
            dropped_video_frames: 0,
        });
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaAdapter for ScriptedAdapter {
    fn events(&self) -> &MediaEvents {
        &self.events
    }

    fn is_current_time_video_buffered(&self) -> bool {
        self.buffered.load(Ordering::SeqCst)
    }

    fn video_playback_quality(&self) -> Option<VideoPlaybackQuality> {
        *self.quality.lock()
    }

    fn has_audio_track(&self) -> bool {
        self.has_audio.load(Ordering::SeqCst)
    }
}
