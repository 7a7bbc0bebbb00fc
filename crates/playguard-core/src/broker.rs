//! Player lifecycle broker
//!
//! Announces "player created" and "player removed" to decoupled consumers,
//! on two independent channels: VOD and Live.
//!
//! There is no implicit replay. A subscriber added after
//! [`LifecycleChannel::inject`] is not called for the existing player.
//! Consumers that need replay-on-mount check [`LifecycleChannel::current`]
//! first, or use [`OnCreateWithCleanup`], which does exactly that.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{
    emitter::{Disposer, EventEmitter},
    Error, Result,
};

/// Named helper objects created alongside a player
pub type Managers = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Which lifecycle channel a player belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerKind {
    Vod,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Created,
    Removed,
}

/// A player and its managers, shared by reference with subscribers
pub struct PlayerInstance<P: ?Sized, M> {
    pub player: Arc<P>,
    pub managers: Arc<M>,
}

impl<P: ?Sized, M> Clone for PlayerInstance<P, M> {
    fn clone(&self) -> Self {
        Self {
            player: self.player.clone(),
            managers: self.managers.clone(),
        }
    }
}

impl<P: ?Sized, M> PlayerInstance<P, M> {
    /// True when both refer to the same player object
    pub fn same_player(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.player, &other.player)
    }
}

/// Subscription returned by [`LifecycleChannel::on_create`]
pub type Subscription<P, M> = Disposer<LifecycleEvent, PlayerInstance<P, M>>;

/// One lifecycle channel (VOD or Live)
pub struct LifecycleChannel<P: ?Sized, M> {
    kind: PlayerKind,
    current: Arc<RwLock<Option<PlayerInstance<P, M>>>>,
    emitter: EventEmitter<LifecycleEvent, PlayerInstance<P, M>>,
}

impl<P: ?Sized, M> Clone for LifecycleChannel<P, M> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            current: self.current.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl<P, M> LifecycleChannel<P, M>
where
    P: ?Sized + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    pub fn new(kind: PlayerKind) -> Self {
        Self {
            kind,
            current: Arc::new(RwLock::new(None)),
            emitter: EventEmitter::new(),
        }
    }

    pub fn kind(&self) -> PlayerKind {
        self.kind
    }

    /// Store the new player, then notify every subscriber in order
    ///
    /// Returns the number of subscribers notified.
    pub fn inject(&self, player: Arc<P>, managers: Arc<M>) -> usize {
        let instance = PlayerInstance { player, managers };
        *self.current.write() = Some(instance.clone());
        let notified = self.emitter.emit(&LifecycleEvent::Created, &instance);
        debug!(kind = ?self.kind, notified, "Player injected");
        notified
    }

    /// Drop the current player and notify removal subscribers
    pub fn remove(&self) -> Option<PlayerInstance<P, M>> {
        let removed = self.current.write().take();
        if let Some(instance) = &removed {
            self.emitter.emit(&LifecycleEvent::Removed, instance);
            debug!(kind = ?self.kind, "Player removed");
        }
        removed
    }

    pub fn current(&self) -> Option<PlayerInstance<P, M>> {
        self.current.read().clone()
    }

    pub fn on_create<F>(&self, callback: F) -> Subscription<P, M>
    where
        F: Fn(&PlayerInstance<P, M>) + Send + Sync + 'static,
    {
        self.emitter.subscribe(LifecycleEvent::Created, callback)
    }

    pub fn on_create_once<F>(&self, callback: F) -> Subscription<P, M>
    where
        F: Fn(&PlayerInstance<P, M>) + Send + Sync + 'static,
    {
        self.emitter.once(LifecycleEvent::Created, callback)
    }

    pub fn off_create(&self, subscription: &Subscription<P, M>) -> bool {
        subscription.dispose()
    }

    pub fn on_remove<F>(&self, callback: F) -> Subscription<P, M>
    where
        F: Fn(&PlayerInstance<P, M>) + Send + Sync + 'static,
    {
        self.emitter.subscribe(LifecycleEvent::Removed, callback)
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count(&LifecycleEvent::Created)
    }

    pub fn remove_listener_count(&self) -> usize {
        self.emitter.listener_count(&LifecycleEvent::Removed)
    }
}

/// Session-owned broker with independent VOD and Live channels
pub struct PlayerLifecycleBroker<P: ?Sized, M = Managers> {
    vod: LifecycleChannel<P, M>,
    live: LifecycleChannel<P, M>,
}

impl<P, M> PlayerLifecycleBroker<P, M>
where
    P: ?Sized + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            vod: LifecycleChannel::new(PlayerKind::Vod),
            live: LifecycleChannel::new(PlayerKind::Live),
        }
    }

    pub fn vod(&self) -> &LifecycleChannel<P, M> {
        &self.vod
    }

    pub fn live(&self) -> &LifecycleChannel<P, M> {
        &self.live
    }

    pub fn channel(&self, kind: PlayerKind) -> &LifecycleChannel<P, M> {
        match kind {
            PlayerKind::Vod => &self.vod,
            PlayerKind::Live => &self.live,
        }
    }
}

impl<P, M> Default for PlayerLifecycleBroker<P, M>
where
    P: ?Sized + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// On-create with cleanup
// =============================================================================

/// Cleanup returned by an on-create callback
pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Callback that may return a cleanup to run before the next invocation
pub type CleanupCallback<P, M> =
    Arc<dyn Fn(&PlayerInstance<P, M>) -> Option<Cleanup> + Send + Sync + 'static>;

struct Binding<P: ?Sized, M> {
    callback: CleanupCallback<P, M>,
    subscription: Subscription<P, M>,
    cleanup: Arc<Mutex<Option<Cleanup>>>,
}

/// Replay-on-mount subscriber that cleans up between player instances
///
/// [`bind`](Self::bind) runs the callback for the current player (if any)
/// and again for every later re-creation, first running whatever cleanup
/// the previous call returned. The callback must stay the same `Arc`
/// across `bind` calls; a different one is rejected with
/// [`Error::UnstableCallback`] instead of silently resubscribing.
pub struct OnCreateWithCleanup<P: ?Sized, M> {
    channel: LifecycleChannel<P, M>,
    binding: Option<Binding<P, M>>,
}

impl<P, M> OnCreateWithCleanup<P, M>
where
    P: ?Sized + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    pub fn new(channel: &LifecycleChannel<P, M>) -> Self {
        Self {
            channel: channel.clone(),
            binding: None,
        }
    }

    pub fn bind(&mut self, callback: &CleanupCallback<P, M>) -> Result<()> {
        if let Some(binding) = &self.binding {
            return if Arc::ptr_eq(&binding.callback, callback) {
                Ok(())
            } else {
                Err(Error::UnstableCallback)
            };
        }

        let cleanup: Arc<Mutex<Option<Cleanup>>> = Arc::new(Mutex::new(None));
        let run = {
            let callback = callback.clone();
            let cleanup = cleanup.clone();
            move |instance: &PlayerInstance<P, M>| {
                let previous = cleanup.lock().take();
                if let Some(previous) = previous {
                    previous();
                }
                let next = callback(instance);
                *cleanup.lock() = next;
            }
        };

        if let Some(instance) = self.channel.current() {
            run(&instance);
        }
        let subscription = self.channel.on_create(run);

        self.binding = Some(Binding {
            callback: callback.clone(),
            subscription,
            cleanup,
        });
        Ok(())
    }
}

impl<P: ?Sized, M> OnCreateWithCleanup<P, M> {
    /// Unsubscribe and run the outstanding cleanup
    pub fn unbind(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.subscription.dispose();
            let pending = binding.cleanup.lock().take();
            if let Some(cleanup) = pending {
                cleanup();
            }
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

impl<P: ?Sized, M> Drop for OnCreateWithCleanup<P, M> {
    fn drop(&mut self) {
        self.unbind();
    }
}
