//! Host context handed to built-in modules
//!
//! A [`HostContext`] is a cheap clone of the runtime's shared pieces. It
//! lets a module issue async work and timers without owning the runtime:
//! the [`Runtime`](super::Runtime) alone decides when the loop stops.

use std::time::Duration;

use crate::error::Result;
use crate::event_loop::{AsyncModuleAdapter, TaskHandle, TimerId, TimerRegistry};

/// Non-owning view of a runtime's counter, scheduler and timers
#[derive(Clone)]
pub struct HostContext {
    adapter: AsyncModuleAdapter,
    timers: TimerRegistry,
}

impl HostContext {
    pub(crate) fn new(adapter: AsyncModuleAdapter, timers: TimerRegistry) -> Self {
        Self { adapter, timers }
    }

    /// Issue blocking `work` and deliver its result to `callback` on the loop.
    ///
    /// See [`AsyncModuleAdapter::spawn_blocking`].
    pub fn spawn_blocking<T, W, C>(&self, label: &'static str, work: W, callback: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) -> Result<()> + Send + 'static,
    {
        self.adapter.spawn_blocking(label, work, callback)
    }

    /// Discard the result of an issued operation
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.adapter.cancel(handle)
    }

    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.timers.set_timeout(delay, callback)
    }

    pub fn set_interval<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.timers.set_interval(interval, callback)
    }

    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.timers.clear_timeout(id)
    }

    /// Whether the caller is running on the event loop thread
    pub fn is_loop_thread(&self) -> bool {
        self.adapter.scheduler().is_loop_thread()
    }

    pub fn pending_operations(&self) -> usize {
        self.adapter.pending_operations()
    }

    pub(crate) fn adapter(&self) -> &AsyncModuleAdapter {
        &self.adapter
    }

    pub(crate) fn timers(&self) -> &TimerRegistry {
        &self.timers
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("pending_operations", &self.pending_operations())
            .field("timers", &self.timers.len())
            .finish()
    }
}
