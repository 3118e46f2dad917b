//! Cancellable blocking work queue
//!
//! [`WorkQueue`] is the pipeline's hand-off point between the scanner, the
//! hashing workers and the commit workers. `dequeue` blocks until an item is
//! available, the queue is closed and drained, or the run's
//! [`CancellationToken`] fires.
//!
//! Cancellation wakes blocked consumers directly: a waiting queue registers
//! itself with the token, and `cancel()` notifies every registered waiter while
//! holding that waiter's lock, so a consumer that checked the flag just before
//! blocking cannot miss the wake-up.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;

/// Anything that parks threads and must be woken on cancellation
pub(crate) trait Wakeable: Send + Sync {
    /// Wake every parked thread so it re-checks its condition
    fn wake_all(&self);
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn Wakeable>>>,
    // Keeps a child's link to its parent alive; the parent only holds it weakly
    parent_link: OnceLock<Arc<dyn Wakeable>>,
}

struct Propagate {
    child: Weak<TokenInner>,
}

impl Wakeable for Propagate {
    fn wake_all(&self) {
        if let Some(inner) = self.child.upgrade() {
            CancellationToken { inner }.cancel();
        }
    }
}

/// Run-scoped cancellation signal
///
/// Cloning yields a handle to the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    /// Create an untriggered token
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake all registered waiters
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<_> = self.inner.listeners.lock().drain(..).collect();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.wake_all();
        }
    }

    /// Token that fires whenever this one does, and can also fire on its own
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let link: Arc<dyn Wakeable> = Arc::new(Propagate {
            child: Arc::downgrade(&child.inner),
        });
        let weak = Arc::downgrade(&link);
        let _ = child.inner.parent_link.set(link);
        self.register(weak);
        child
    }

    /// Whether the signal has been raised
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, waiter: Weak<dyn Wakeable>) {
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|w| w.strong_count() > 0);
        if !listeners.iter().any(|w| Weak::ptr_eq(w, &waiter)) {
            listeners.push(waiter.clone());
        }
        drop(listeners);
        // Cancelled between the caller's check and registration
        if self.is_cancelled() {
            if let Some(waiter) = waiter.upgrade() {
                waiter.wake_all();
            }
        }
    }
}

/// Why `dequeue` returned without an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DequeueError {
    /// The cancellation token fired
    #[error("dequeue cancelled")]
    Cancelled,
    /// The queue was closed and is empty
    #[error("queue closed")]
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T: Send> Wakeable for QueueShared<T> {
    fn wake_all(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }
}

/// Thread-safe FIFO with blocking, cancellable dequeue
///
/// Single-producer/single-consumer use preserves enqueue order. With several
/// producers every item is still dequeued exactly once.
pub struct WorkQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Append one item and wake one waiter
    pub fn enqueue(&self, item: T) {
        let mut state = self.shared.state.lock();
        state.items.push_back(item);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Append a batch under one lock, then wake waiters
    ///
    /// All items are visible before any waiter is released, so a consumer woken
    /// by the batch never finds the queue empty on account of it.
    pub fn enqueue_many<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.shared.state.lock();
        let before = state.items.len();
        state.items.extend(items);
        let added = state.items.len() - before;
        drop(state);

        match added {
            0 => {}
            1 => {
                self.shared.available.notify_one();
            }
            _ => {
                self.shared.available.notify_all();
            }
        }
        added
    }

    /// Block until an item is available
    ///
    /// Returns [`DequeueError::Cancelled`] as soon as `token` fires, even if
    /// items remain, and [`DequeueError::Closed`] once the queue is closed and
    /// drained.
    pub fn dequeue(&self, token: &CancellationToken) -> Result<T, DequeueError> {
        let mut registered = false;
        let mut state = self.shared.state.lock();
        loop {
            if token.is_cancelled() {
                return Err(DequeueError::Cancelled);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(DequeueError::Closed);
            }
            if !registered {
                // Register without holding our own lock; cancel() takes it to notify
                drop(state);
                let weak: Weak<dyn Wakeable> = Arc::downgrade(&self.shared) as Weak<dyn Wakeable>;
                token.register(weak);
                registered = true;
                state = self.shared.state.lock();
                continue;
            }
            self.shared.available.wait(&mut state);
        }
    }

    /// Take an item without blocking
    pub fn try_dequeue(&self) -> Option<T> {
        self.shared.state.lock().items.pop_front()
    }

    /// Mark the queue closed; waiters return `Closed` once it drains
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        drop(state);
        self.shared.available.notify_all();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
