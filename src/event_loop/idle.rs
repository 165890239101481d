//! Idle detection
//!
//! Lets a driving thread block until every outstanding operation has
//! completed. The count is checked under the counter's own lock before the
//! waiter registers and again after every wakeup, so a transition to zero
//! can never slip in between the check and the wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::counter::PendingOperationCounter;

/// Blocks callers until the [`PendingOperationCounter`] reaches zero
#[derive(Debug, Clone)]
pub struct IdleWaiter {
    counter: Arc<PendingOperationCounter>,
}

impl IdleWaiter {
    pub fn new(counter: Arc<PendingOperationCounter>) -> Self {
        Self { counter }
    }

    /// Wait until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` when idle, `false` when operations were still
    /// outstanding at the deadline. Never blocks when already idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut state = self.counter.state.lock();
        if state.pending == 0 {
            return true;
        }

        let deadline = Instant::now().checked_add(timeout);
        state.waiters += 1;
        tracing::debug!(pending = state.pending, ?timeout, "waiting for pending operations");

        let idle = loop {
            if state.pending == 0 {
                break true;
            }
            match deadline {
                Some(deadline) => {
                    if self.counter.idle.wait_until(&mut state, deadline).timed_out() {
                        break state.pending == 0;
                    }
                }
                None => self.counter.idle.wait(&mut state),
            }
        };

        state.waiters -= 1;
        if !idle {
            tracing::debug!(pending = state.pending, "idle wait timed out");
        }
        idle
    }

    /// Non-blocking idle check
    pub fn is_idle(&self) -> bool {
        self.counter.is_idle()
    }

    /// Number of threads currently blocked in [`wait_for_idle`](Self::wait_for_idle)
    pub fn waiters(&self) -> usize {
        self.counter.state.lock().waiters
    }
}
