//! Async module adapter
//!
//! The contract every asynchronous built-in follows:
//!
//! 1. take a pending-operation token before the work is issued
//! 2. run the blocking part on the worker pool, never on the caller
//! 3. invoke the completion callback on the loop thread, on success and on
//!    every kind of failure alike
//! 4. release the token after the callback has returned

use std::sync::Arc;

use super::counter::PendingOperationCounter;
use super::scheduler::{TaskHandle, TaskScheduler};
use crate::error::Result;

/// Issues blocking work on behalf of a built-in module
#[derive(Clone)]
pub struct AsyncModuleAdapter {
    counter: Arc<PendingOperationCounter>,
    scheduler: Arc<TaskScheduler>,
}

impl AsyncModuleAdapter {
    pub fn new(counter: Arc<PendingOperationCounter>, scheduler: Arc<TaskScheduler>) -> Self {
        Self { counter, scheduler }
    }

    /// Run `work` off the loop and hand its result to `callback` on the loop.
    ///
    /// The operation counts as pending from this call until `callback`
    /// returns. `label` names the operation in logs (`"fs.readFile"`).
    pub fn spawn_blocking<T, W, C>(&self, label: &'static str, work: W, callback: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) -> Result<()> + Send + 'static,
    {
        let op = self.counter.begin();
        let handle = self.scheduler.run_blocking(work, move |result| {
            if let Err(err) = &result {
                tracing::debug!(operation = label, error = %err, "async operation failed");
            }
            let outcome = callback(result);
            op.complete();
            outcome
        });
        tracing::trace!(operation = label, %handle, "async operation issued");
        handle
    }

    /// Discard the result of an issued operation. The callback still runs,
    /// with [`Error::Cancelled`](crate::Error::Cancelled).
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.scheduler.cancel(handle)
    }

    pub fn pending_operations(&self) -> usize {
        self.counter.count()
    }

    pub(crate) fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }
}
