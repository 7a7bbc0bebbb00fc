//! Typed publish/subscribe emitter
//!
//! Handlers are keyed by an event kind and run synchronously inside
//! [`EventEmitter::emit`], in subscription order. The handler list is
//! snapshotted before dispatch, so handlers added during an emission only see
//! later emissions. A panicking handler is logged and skipped; it never takes
//! down the emitter or the handlers after it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

/// Shared event handler
pub type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Listener<A> {
    id: u64,
    once: bool,
    handler: Handler<A>,
}

struct Inner<K, A> {
    next_id: u64,
    listeners: HashMap<K, Vec<Listener<A>>>,
}

impl<K: Eq + Hash, A> Inner<K, A> {
    fn remove(&mut self, key: &K, id: u64) -> bool {
        let Some(list) = self.listeners.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|listener| listener.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.listeners.remove(key);
        }
        removed
    }
}

/// Keyed event emitter with symmetric subscribe/dispose
pub struct EventEmitter<K, A> {
    inner: Arc<Mutex<Inner<K, A>>>,
}

impl<K, A> Clone for EventEmitter<K, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, A> Default for EventEmitter<K, A>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    A: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> EventEmitter<K, A>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    A: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    /// Register a handler for `key`
    pub fn subscribe<F>(&self, key: K, handler: F) -> Disposer<K, A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.add(key, Arc::new(handler), false)
    }

    /// Register a shared handler for `key`
    pub fn subscribe_shared(&self, key: K, handler: Handler<A>) -> Disposer<K, A> {
        self.add(key, handler, false)
    }

    /// Register a handler that is removed before its first invocation
    pub fn once<F>(&self, key: K, handler: F) -> Disposer<K, A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.add(key, Arc::new(handler), true)
    }

    fn add(&self, key: K, handler: Handler<A>, once: bool) -> Disposer<K, A> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push(Listener { id, once, handler });
        Disposer {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Dispatch `args` to every handler registered for `key`
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, key: &K, args: &A) -> usize {
        let snapshot: Vec<Handler<A>> = {
            let mut inner = self.inner.lock();
            let Some(list) = inner.listeners.get_mut(key) else {
                return 0;
            };
            let handlers = list.iter().map(|l| l.handler.clone()).collect();
            list.retain(|l| !l.once);
            if list.is_empty() {
                inner.listeners.remove(key);
            }
            handlers
        };

        for handler in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(args))).is_err() {
                error!(event = ?key, "Event handler panicked");
            }
        }
        snapshot.len()
    }

    pub fn listener_count(&self, key: &K) -> usize {
        self.inner
            .lock()
            .listeners
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_listener_count(&self) -> usize {
        self.inner.lock().listeners.values().map(Vec::len).sum()
    }

    pub fn remove_all(&self) {
        self.inner.lock().listeners.clear();
    }
}

/// Removes one subscription when disposed
///
/// Dropping a `Disposer` does not unsubscribe; call [`Disposer::dispose`].
pub struct Disposer<K, A> {
    inner: Weak<Mutex<Inner<K, A>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, A> Disposer<K, A> {
    /// Unsubscribe; returns false if already removed
    pub fn dispose(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.lock().remove(&self.key, self.id),
            None => false,
        }
    }
}

impl<K: std::fmt::Debug, A> std::fmt::Debug for Disposer<K, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Ev {
        Ping,
        Pong,
    }

    #[test]
    fn test_emit_in_subscription_order() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = order.clone();
            emitter.subscribe(Ev::Ping, move |n: &u32| order.lock().push((tag, *n)));
        }

        assert_eq!(emitter.emit(&Ev::Ping, &7), 3);
        assert_eq!(*order.lock(), vec![("a", 7), ("b", 7), ("c", 7)]);
        assert_eq!(emitter.emit(&Ev::Pong, &1), 0);
    }

    #[test]
    fn test_dispose_is_symmetric() {
        let emitter: EventEmitter<Ev, ()> = EventEmitter::new();
        let disposer = emitter.subscribe(Ev::Ping, |_| {});
        emitter.subscribe(Ev::Pong, |_| {});

        assert_eq!(emitter.listener_count(&Ev::Ping), 1);
        assert!(disposer.dispose());
        assert!(!disposer.dispose());
        assert_eq!(emitter.listener_count(&Ev::Ping), 0);
        assert_eq!(emitter.total_listener_count(), 1);
    }

    #[test]
    fn test_once_handler() {
        let emitter: EventEmitter<Ev, ()> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        emitter.once(Ev::Ping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&Ev::Ping, &());
        emitter.emit(&Ev::Ping, &());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(&Ev::Ping), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let emitter: EventEmitter<Ev, ()> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.subscribe(Ev::Ping, |_| panic!("bad consumer"));
        let counter = hits.clone();
        emitter.subscribe(Ev::Ping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(emitter.emit(&Ev::Ping, &()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_during_emit_sees_next_emission_only() {
        let emitter: EventEmitter<Ev, ()> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_emitter = emitter.clone();
        let counter = hits.clone();
        emitter.once(Ev::Ping, move |_| {
            let counter = counter.clone();
            inner_emitter.subscribe(Ev::Ping, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        emitter.emit(&Ev::Ping, &());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        emitter.emit(&Ev::Ping, &());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
