//! Pending operation counter
//!
//! The single source of truth for "is the runtime idle". Every asynchronous
//! operation increments the counter before it is issued and decrements it
//! exactly once after its callback ran. Idle waiters sleep on a condition
//! variable that shares the counter's mutex.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct CounterState {
    /// Operations issued but not yet completed
    pub(crate) pending: usize,
    /// Threads currently blocked in an idle wait
    pub(crate) waiters: usize,
}

/// Thread-safe counter of in-flight asynchronous operations
#[derive(Debug, Default)]
pub struct PendingOperationCounter {
    pub(crate) state: Mutex<CounterState>,
    pub(crate) idle: Condvar,
}

impl PendingOperationCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more outstanding operation
    pub fn increment(&self) {
        let mut state = self.state.lock();
        state.pending += 1;
        tracing::trace!(pending = state.pending, "pending operation added");
    }

    /// Record the completion of an outstanding operation.
    ///
    /// Reaching zero wakes every idle waiter. A decrement with nothing
    /// outstanding is a broken pairing somewhere in a caller: it is logged
    /// and reported as [`Error::CounterUnderflow`], and the count stays at zero.
    pub fn decrement(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending == 0 {
            drop(state);
            tracing::error!(
                "pending operation counter decremented below zero; idle detection is unreliable"
            );
            return Err(Error::CounterUnderflow);
        }
        state.pending -= 1;
        tracing::trace!(pending = state.pending, "pending operation completed");
        if state.pending == 0 {
            self.idle.notify_all();
        }
        Ok(())
    }

    /// Current number of outstanding operations
    pub fn count(&self) -> usize {
        self.state.lock().pending
    }

    /// Whether nothing is outstanding right now
    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Increment now and get a token that decrements when dropped.
    ///
    /// Dropping happens on every path out of the owning scope, panics
    /// included, so the pairing cannot be lost on an error path.
    pub fn begin(self: &Arc<Self>) -> PendingOperation {
        self.increment();
        PendingOperation {
            counter: Arc::clone(self),
        }
    }

    /// Take ownership of an increment that was already made.
    pub(crate) fn adopt(self: &Arc<Self>) -> PendingOperation {
        PendingOperation {
            counter: Arc::clone(self),
        }
    }
}

/// An outstanding operation; completes (decrements) on drop
#[derive(Debug)]
#[must_use = "dropping the token immediately completes the operation"]
pub struct PendingOperation {
    counter: Arc<PendingOperationCounter>,
}

impl PendingOperation {
    /// Complete the operation now
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        // The token owns exactly one increment, so an error here means some
        // other caller decremented without owning one.
        let _ = self.counter.decrement();
    }
}
