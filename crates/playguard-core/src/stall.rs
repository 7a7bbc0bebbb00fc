//! Startup stall detection
//!
//! A per-player state machine that watches low-level buffering signals
//! after playback starts:
//!
//! ```text
//! Idle -> AwaitingSignal -> TimerArmed -> ResolvedClean | StalledFatal
//! ```
//!
//! The readiness condition that arms the dwell timer, and what happens when
//! it expires, depend on the [`StallStrategy`] picked once at construction.
//! A `loadeddata` signal before expiry resolves cleanly. A declared stall
//! is emitted as a synthetic fatal `error` event on the adapter, so it flows
//! through the same pipeline as native errors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    adapter::MediaAdapter,
    classifier::{CONTENT_STARTUP_STALL, MEDIA_ERROR},
    emitter::Disposer,
    timer::CancellableTimer,
    types::{
        ErrorSource, FragType, MediaEvent, MediaEventKind, Platform, RawError, TrackKind,
    },
};

/// Default dwell between readiness and a stall verdict
pub const DEFAULT_STALL_DWELL: Duration = Duration::from_millis(5000);

/// Platform policy for detecting startup stalls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallStrategy {
    /// Arm on the first main fragment loaded; declare unconditionally
    FragmentLoaded,
    /// Arm once video (and audio, if present) fragments are buffered;
    /// re-check buffering and frame progress before declaring
    FragmentBuffered,
    /// No detection
    Disabled,
}

impl StallStrategy {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::FireTvHyb => StallStrategy::FragmentLoaded,
            Platform::Lgtv => StallStrategy::FragmentBuffered,
            _ => StallStrategy::Disabled,
        }
    }

    fn watched_events(&self) -> &'static [MediaEventKind] {
        match self {
            StallStrategy::FragmentLoaded => &[MediaEventKind::FragLoaded, MediaEventKind::LoadedData],
            StallStrategy::FragmentBuffered => {
                &[MediaEventKind::FragBuffered, MediaEventKind::LoadedData]
            }
            StallStrategy::Disabled => &[],
        }
    }
}

/// Detector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPhase {
    Idle,
    AwaitingSignal,
    TimerArmed,
    ResolvedClean,
    StalledFatal,
    Destroyed,
}

impl StallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StallPhase::ResolvedClean | StallPhase::StalledFatal | StallPhase::Destroyed
        )
    }
}

/// Per-track buffering progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragBuffered {
    pub video: bool,
    pub audio: bool,
}

/// Synthetic fatal error raised when a stall is declared
pub fn stall_error(dwell: Duration) -> RawError {
    RawError::with_type(MEDIA_ERROR)
        .with_details(CONTENT_STARTUP_STALL)
        .with_message(format!(
            "No playback progress {}ms after startup",
            dwell.as_millis()
        ))
        .with_source(ErrorSource::Synthetic)
        .with_fatal(true)
}

struct DetectorState {
    phase: StallPhase,
    video_frag_loaded: bool,
    frag_buffered: FragBuffered,
    frames_at_arm: Option<u64>,
    timer: Option<CancellableTimer>,
    listeners: Vec<Disposer<MediaEventKind, MediaEvent>>,
}

impl DetectorState {
    /// Cancel the timer and unsubscribe
    fn detach(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        for listener in self.listeners.drain(..) {
            listener.dispose();
        }
    }
}

struct DetectorInner {
    strategy: StallStrategy,
    dwell: Duration,
    adapter: Arc<dyn MediaAdapter>,
    state: Mutex<DetectorState>,
}

/// Startup stall detector bound to one player instance
#[derive(Clone)]
pub struct StallDetector {
    inner: Arc<DetectorInner>,
}

impl StallDetector {
    /// Create an idle detector; call [`StallDetector::attach`] to start watching
    pub fn new(adapter: Arc<dyn MediaAdapter>, strategy: StallStrategy, dwell: Duration) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                strategy,
                dwell,
                adapter,
                state: Mutex::new(DetectorState {
                    phase: StallPhase::Idle,
                    video_frag_loaded: false,
                    frag_buffered: FragBuffered::default(),
                    frames_at_arm: None,
                    timer: None,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Subscribe to the adapter's buffering events
    pub fn attach(&self) {
        let mut state = self.inner.state.lock();
        if state.phase != StallPhase::Idle {
            return;
        }
        if self.inner.strategy == StallStrategy::Disabled {
            debug!("Stall detection disabled for this platform");
            state.phase = StallPhase::ResolvedClean;
            return;
        }

        for kind in self.inner.strategy.watched_events() {
            let weak = Arc::downgrade(&self.inner);
            let disposer = self.inner.adapter.events().subscribe(*kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    DetectorInner::on_event(&inner, event);
                }
            });
            state.listeners.push(disposer);
        }
        state.phase = StallPhase::AwaitingSignal;
        debug!(strategy = ?self.inner.strategy, "Stall detector attached");
    }

    /// Cancel any armed timer and unsubscribe; safe to call repeatedly
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        state.detach();
        if !state.phase.is_terminal() {
            state.phase = StallPhase::Destroyed;
        }
    }

    pub fn phase(&self) -> StallPhase {
        self.inner.state.lock().phase
    }

    pub fn strategy(&self) -> StallStrategy {
        self.inner.strategy
    }

    pub fn is_timer_armed(&self) -> bool {
        self.inner
            .state
            .lock()
            .timer
            .as_ref()
            .is_some_and(CancellableTimer::is_armed)
    }

    pub fn frag_buffered(&self) -> FragBuffered {
        self.inner.state.lock().frag_buffered
    }

    pub fn video_frag_loaded(&self) -> bool {
        self.inner.state.lock().video_frag_loaded
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }
}

impl DetectorInner {
    fn on_event(this: &Arc<Self>, event: &MediaEvent) {
        let mut state = this.state.lock();
        if state.phase.is_terminal() {
            return;
        }

        match event {
            MediaEvent::LoadedData => {
                debug!(phase = ?state.phase, "Data loaded before stall dwell elapsed");
                state.detach();
                state.phase = StallPhase::ResolvedClean;
            }
            MediaEvent::FragLoaded { frag_type: FragType::Main }
                if this.strategy == StallStrategy::FragmentLoaded =>
            {
                state.video_frag_loaded = true;
                if state.phase == StallPhase::AwaitingSignal {
                    Self::arm(this, &mut state);
                }
            }
            MediaEvent::FragBuffered { track } if this.strategy == StallStrategy::FragmentBuffered => {
                match track {
                    TrackKind::Video => state.frag_buffered.video = true,
                    TrackKind::Audio => state.frag_buffered.audio = true,
                }
                let audio_ready = state.frag_buffered.audio || !this.adapter.has_audio_track();
                if state.phase == StallPhase::AwaitingSignal && state.frag_buffered.video && audio_ready {
                    Self::arm(this, &mut state);
                }
            }
            _ => {}
        }
    }

    fn arm(this: &Arc<Self>, state: &mut DetectorState) {
        state.frames_at_arm = this
            .adapter
            .video_playback_quality()
            .map(|q| q.total_video_frames);
        let weak: Weak<Self> = Arc::downgrade(this);
        state.timer = Some(CancellableTimer::start(this.dwell, move || {
            if let Some(inner) = weak.upgrade() {
                Self::on_expired(&inner);
            }
        }));
        state.phase = StallPhase::TimerArmed;
        debug!(dwell_ms = this.dwell.as_millis() as u64, "Stall timer armed");
    }

    fn on_expired(this: &Arc<Self>) {
        let stalled = {
            let mut state = this.state.lock();
            if state.phase != StallPhase::TimerArmed {
                return;
            }
            let stalled = match this.strategy {
                StallStrategy::FragmentLoaded => true,
                StallStrategy::FragmentBuffered => this.revalidate(state.frames_at_arm),
                StallStrategy::Disabled => false,
            };
            state.timer = None;
            state.detach();
            state.phase = if stalled {
                StallPhase::StalledFatal
            } else {
                StallPhase::ResolvedClean
            };
            stalled
        };

        if stalled {
            warn!(dwell_ms = this.dwell.as_millis() as u64, "Content startup stall detected");
            this.adapter.emit(MediaEvent::Error(stall_error(this.dwell)));
        } else {
            info!("Stall timer expired but playback is progressing");
        }
    }

    /// True when video is buffered at the playhead yet no frames were decoded
    fn revalidate(&self, frames_at_arm: Option<u64>) -> bool {
        if !self.adapter.is_current_time_video_buffered() {
            return false;
        }
        let frames_now = self
            .adapter
            .video_playback_quality()
            .map(|q| q.total_video_frames);
        match (frames_at_arm, frames_now) {
            (Some(before), Some(now)) => now <= before,
            _ => true,
        }
    }
}

impl std::fmt::Debug for StallDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallDetector")
            .field("strategy", &self.inner.strategy)
            .field("phase", &self.phase())
            .finish()
    }
}
