//! Cancellable one-shot timers
//!
//! Every timeout, refill and dwell in this crate is a [`CancellableTimer`]: a
//! spawned task that sleeps on the tokio clock and then runs a callback. Tests
//! drive them with a paused clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// One-shot timer that can be cancelled before it fires
#[derive(Debug)]
pub struct CancellableTimer {
    handle: JoinHandle<()>,
    done: Arc<AtomicBool>,
}

impl CancellableTimer {
    /// Arm a timer that runs `callback` after `delay`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let fired = done.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !fired.swap(true, Ordering::SeqCst) {
                callback();
            }
        });
        Self { handle, done }
    }

    /// Cancel the timer; a no-op if it already fired or was cancelled
    pub fn cancel(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.handle.abort();
        }
    }

    /// True while the timer has neither fired nor been cancelled
    pub fn is_armed(&self) -> bool {
        !self.done.load(Ordering::SeqCst)
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
