//! Pending operation registry
//!
//! Tracks outstanding asynchronous operations (ad fetches, DRM handshakes)
//! so they can be timed out, aborted individually, or drained all at once
//! when a session ends.
//!
//! Settlement is exactly-once per operation. Resolve, reject, timeout and
//! abort all funnel through one guarded step that marks the operation
//! settled, cancels its timer and removes it from the registry before any
//! user callback runs. Whoever reaches the guard first wins; every later
//! attempt is a no-op.
//!
//! [`PendingOperationRegistry::abort_all`] drains entries last-in-first-out.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{timer::CancellableTimer, Error, Result};

/// Cleanup hook run just before a rejection is delivered
pub type RejectHook = Box<dyn FnOnce() + Send + 'static>;

type ResolveFn<T> = Box<dyn FnOnce(T) + Send + 'static>;
type RejectFn = Box<dyn FnOnce(Error) + Send + 'static>;

const DEFAULT_HANDLER_NAME: &str = "anonymous";

/// Options accepted by [`PendingOperationRegistry::start`]
#[derive(Default)]
pub struct StartOptions {
    timeout: Option<Duration>,
    timeout_callback: Option<RejectHook>,
    on_reject: Option<RejectHook>,
    handler_name: Option<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject with a timeout error if not settled within `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs on expiry, before the timeout rejection is delivered
    pub fn on_timeout<F: FnOnce() + Send + 'static>(mut self, callback: F) -> Self {
        self.timeout_callback = Some(Box::new(callback));
        self
    }

    /// Runs before any rejection is delivered
    pub fn on_reject<F: FnOnce() + Send + 'static>(mut self, hook: F) -> Self {
        self.on_reject = Some(Box::new(hook));
        self
    }

    pub fn handler_name(mut self, name: impl Into<String>) -> Self {
        self.handler_name = Some(name.into());
        self
    }
}

impl std::fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartOptions")
            .field("timeout", &self.timeout)
            .field("handler_name", &self.handler_name)
            .finish()
    }
}

// =============================================================================
// Operation
// =============================================================================

struct OperationState<T> {
    settled: bool,
    resolve: Option<ResolveFn<T>>,
    reject: Option<RejectFn>,
    on_reject: Option<RejectHook>,
    timeout_callback: Option<RejectHook>,
    timer: Option<CancellableTimer>,
}

struct Operation<T> {
    id: u64,
    name: String,
    state: Mutex<OperationState<T>>,
    registry: Weak<Mutex<RegistryInner>>,
}

/// Callbacks taken out of an operation when it settles
struct Settlement<T> {
    resolve: Option<ResolveFn<T>>,
    reject: Option<RejectFn>,
    on_reject: Option<RejectHook>,
    timeout_callback: Option<RejectHook>,
}

impl<T: Send + 'static> Operation<T> {
    /// The single settlement gate
    ///
    /// Marks the operation settled, clears its timer and unregisters it. Returns
    /// `None` if some other path already settled it.
    fn on_settled(&self) -> Option<Settlement<T>> {
        let (settlement, timer) = {
            let mut state = self.state.lock();
            if state.settled {
                return None;
            }
            state.settled = true;
            (
                Settlement {
                    resolve: state.resolve.take(),
                    reject: state.reject.take(),
                    on_reject: state.on_reject.take(),
                    timeout_callback: state.timeout_callback.take(),
                },
                state.timer.take(),
            )
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.id);
        }
        Some(settlement)
    }

    fn resolve(&self, value: T) -> bool {
        let Some(settlement) = self.on_settled() else {
            return false;
        };
        debug!(handler = %self.name, "Pending operation resolved");
        if let Some(resolve) = settlement.resolve {
            resolve(value);
        }
        true
    }

    fn reject(&self, err: Error) -> bool {
        let Some(settlement) = self.on_settled() else {
            return false;
        };
        debug!(handler = %self.name, error = %err, "Pending operation rejected");
        Self::deliver_rejection(settlement, err);
        true
    }

    fn expire(&self) {
        let Some(mut settlement) = self.on_settled() else {
            return;
        };
        warn!(handler = %self.name, "Pending operation timed out");
        if let Some(callback) = settlement.timeout_callback.take() {
            callback();
        }
        Self::deliver_rejection(
            settlement,
            Error::Timeout {
                name: self.name.clone(),
            },
        );
    }

    fn deliver_rejection(settlement: Settlement<T>, err: Error) {
        if let Some(hook) = settlement.on_reject {
            hook();
        }
        if let Some(reject) = settlement.reject {
            reject(err);
        }
    }

    fn is_settled(&self) -> bool {
        self.state.lock().settled
    }
}

/// Type-erased view of an operation held by the registry
trait PendingEntry: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn abort(&self, message: Option<&str>) -> bool;
}

impl<T: Send + 'static> PendingEntry for Operation<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn abort(&self, message: Option<&str>) -> bool {
        self.reject(Error::aborted(&self.name, message))
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Caller-facing handle to a pending operation
///
/// Clones share the same operation. Settling through any clone settles all.
pub struct OperationHandle<T> {
    op: Arc<Operation<T>>,
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            op: self.op.clone(),
        }
    }
}

impl<T: Send + 'static> OperationHandle<T> {
    /// Resolve the operation; returns false if it was already settled
    pub fn resolve(&self, value: T) -> bool {
        self.op.resolve(value)
    }

    /// Reject the operation; returns false if it was already settled
    pub fn reject(&self, err: Error) -> bool {
        self.op.reject(err)
    }

    pub fn name(&self) -> &str {
        &self.op.name
    }

    pub fn is_settled(&self) -> bool {
        self.op.is_settled()
    }

    /// Attach a late-bound cleanup hook; ignored once settled
    fn set_on_reject(&self, hook: RejectHook) {
        let mut state = self.op.state.lock();
        if !state.settled {
            state.on_reject = Some(hook);
        }
    }
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.op.id)
            .field("name", &self.op.name)
            .finish()
    }
}

// =============================================================================
// Tracked Promise
// =============================================================================

/// Future returned by [`PendingOperationRegistry::create_promise`]
pub struct TrackedPromise<T> {
    handle: OperationHandle<T>,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TrackedPromise<T> {
    /// Handle for settling or aborting this promise from elsewhere
    pub fn handle(&self) -> &OperationHandle<T> {
        &self.handle
    }
}

impl<T> Future for TrackedPromise<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Internal(format!(
                "pending operation {} dropped without settling",
                self.handle.op.name
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Arc<dyn PendingEntry>>,
}

impl RegistryInner {
    fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|e| e.id() == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Session-scoped registry of outstanding operations
#[derive(Clone, Default)]
pub struct PendingOperationRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl PendingOperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending operation wrapping `resolve` and `reject`
    ///
    /// When `options.timeout` is set, a timer is armed that runs the timeout
    /// callback and then rejects with [`Error::Timeout`].
    pub fn start<T, R, J>(&self, resolve: R, reject: J, options: StartOptions) -> OperationHandle<T>
    where
        T: Send + 'static,
        R: FnOnce(T) + Send + 'static,
        J: FnOnce(Error) + Send + 'static,
    {
        let StartOptions {
            timeout,
            timeout_callback,
            on_reject,
            handler_name,
        } = options;

        let op = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let op = Arc::new(Operation {
                id: inner.next_id,
                name: handler_name.unwrap_or_else(|| DEFAULT_HANDLER_NAME.to_string()),
                state: Mutex::new(OperationState {
                    settled: false,
                    resolve: Some(Box::new(resolve)),
                    reject: Some(Box::new(reject)),
                    on_reject,
                    timeout_callback,
                    timer: None,
                }),
                registry: Arc::downgrade(&self.inner),
            });
            inner.entries.push(op.clone() as Arc<dyn PendingEntry>);
            op
        };

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&op);
            let timer = CancellableTimer::start(timeout, move || {
                if let Some(op) = weak.upgrade() {
                    op.expire();
                }
            });
            let mut state = op.state.lock();
            if !state.settled {
                state.timer = Some(timer);
            }
        }

        debug!(handler = %op.name, timeout = ?timeout, "Pending operation started");
        OperationHandle { op }
    }

    /// Build a tracked future whose settlement is wired through [`start`]
    ///
    /// The executor receives the handle and may return a cleanup hook that
    /// runs before any rejection propagates (e.g. aborting a request).
    ///
    /// [`start`]: PendingOperationRegistry::start
    pub fn create_promise<T, F>(&self, executor: F, options: StartOptions) -> TrackedPromise<T>
    where
        T: Send + 'static,
        F: FnOnce(OperationHandle<T>) -> Option<RejectHook>,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let reject_tx = tx.clone();

        let handle = self.start(
            move |value| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(value));
                }
            },
            move |err| {
                if let Some(tx) = reject_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
            options,
        );

        if let Some(hook) = executor(handle.clone()) {
            handle.set_on_reject(hook);
        }

        TrackedPromise { handle, rx }
    }

    /// Force-reject a specific operation
    pub fn abort<T: Send + 'static>(&self, handle: &OperationHandle<T>, message: Option<&str>) -> bool {
        handle.reject(Error::aborted(handle.name(), message))
    }

    /// Stop tracking an operation without settling it
    ///
    /// The operation keeps its timeout and can still be settled through its
    /// handle, but [`abort_all`](Self::abort_all) no longer reaches it.
    pub fn release<T: Send + 'static>(&self, handle: &OperationHandle<T>) -> bool {
        let released = self.inner.lock().remove(handle.op.id);
        if released {
            debug!(handler = %handle.op.name, "Pending operation released");
        }
        released
    }

    /// Abort every pending operation, most recent first
    ///
    /// Returns the number of operations aborted. The registry is empty afterwards.
    pub fn abort_all(&self, message: Option<&str>) -> usize {
        let mut aborted = 0;
        loop {
            let entry = self.inner.lock().entries.pop();
            let Some(entry) = entry else {
                break;
            };
            debug!(handler = entry.name(), "Aborting pending operation");
            if entry.abort(message) {
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!(count = aborted, "Aborted all pending operations");
        }
        aborted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Handler names in registration order
    pub fn pending_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for PendingOperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperationRegistry")
            .field("pending", &self.len())
            .finish()
    }
}
