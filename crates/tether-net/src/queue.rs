//! Thread-safe double-ended queue used as the inbound message hand-off.
//!
//! The I/O worker pushes from any number of session tasks; the application
//! thread drains. A condition variable lets the application block in
//! [`TsDeque::wait`] until something arrives, which backs the `wait` flavour
//! of the server's `update`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Mutex-guarded deque with a blocking wait, safe under arbitrary
/// multi-producer / multi-consumer contention. Elements are moved in and out,
/// never cloned.
pub struct TsDeque<T> {
    inner: Mutex<VecDeque<T>>,
    signal: Condvar,
}

impl<T> TsDeque<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an element at the back, waking one waiting thread.
    pub fn push_back(&self, value: T) {
        self.guard().push_back(value);
        self.signal.notify_one();
    }

    /// Insert an element at the front, waking one waiting thread.
    pub fn push_front(&self, value: T) {
        self.guard().push_front(value);
        self.signal.notify_one();
    }

    /// Remove and return the front element, or `None` when empty.
    pub fn pop_front(&self) -> Option<T> {
        self.guard().pop_front()
    }

    /// Remove and return the back element, or `None` when empty.
    pub fn pop_back(&self) -> Option<T> {
        self.guard().pop_back()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Drop every queued element.
    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Block the calling thread until the queue is non-empty.
    ///
    /// Tolerates spurious wakeups: returns only after observing a non-empty
    /// queue under the lock. Another consumer may still win the race for the
    /// element afterwards; pair with [`pop_front`](Self::pop_front) and
    /// handle `None`.
    pub fn wait(&self) {
        let mut queue = self.guard();
        while queue.is_empty() {
            queue = self
                .signal
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl<T> Default for TsDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}
