//! Runtime environment for Tidepool
//!
//! [`Runtime`] owns one event loop with its pending-operation counter,
//! worker pool, timer registry and built-in modules. Several runtimes can
//! live in one process; nothing is global.
//!
//! ```no_run
//! use std::time::Duration;
//! use tidepool::Runtime;
//!
//! let runtime = Runtime::new()?;
//! runtime.set_timeout(10, || {
//!     println!("tick");
//!     Ok(())
//! });
//! assert!(runtime.wait_for_idle(Duration::from_secs(1)));
//! # Ok::<(), tidepool::Error>(())
//! ```

mod context;
mod driver;

pub use context::HostContext;
pub use driver::{Completion, ScriptDriver};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::event_loop::{
    log_reporter, AsyncModuleAdapter, ErrorReporter, IdleWaiter, PendingOperationCounter,
    SchedulerStats, TaskHandle, TaskScheduler, TimerId, TimerRegistry,
};
use crate::native::Builtin;

/// The Tidepool runtime
pub struct Runtime {
    config: RuntimeConfig,
    counter: Arc<PendingOperationCounter>,
    scheduler: Arc<TaskScheduler>,
    context: HostContext,
    idle: IdleWaiter,
    modules: Mutex<HashMap<&'static str, Builtin>>,
}

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        Self::with_reporter(config, log_reporter())
    }

    /// Create a runtime whose uncaught callback errors go to `reporter`
    pub fn with_reporter(config: RuntimeConfig, reporter: ErrorReporter) -> Result<Self> {
        config.validate()?;

        let counter = Arc::new(PendingOperationCounter::new());
        let scheduler = Arc::new(TaskScheduler::new(
            config.worker_threads,
            config.queue_capacity,
            reporter,
        )?);
        let adapter = AsyncModuleAdapter::new(Arc::clone(&counter), Arc::clone(&scheduler));
        let timers = TimerRegistry::new(Arc::clone(&scheduler), Arc::clone(&counter));

        tracing::debug!(workers = config.worker_threads, "runtime created");
        Ok(Self {
            idle: IdleWaiter::new(Arc::clone(&counter)),
            context: HostContext::new(adapter, timers),
            config,
            counter,
            scheduler,
            modules: Mutex::new(HashMap::default()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Pending operations
    // ---------------------------------------------------------------------

    pub fn increment_pending_operations(&self) {
        self.counter.increment();
    }

    pub fn decrement_pending_operations(&self) -> Result<()> {
        self.counter.decrement()
    }

    pub fn pending_operations_count(&self) -> usize {
        self.counter.count()
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Run `callback` on the loop after `delay`. Not counted as pending.
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.scheduler.schedule_after(delay, callback)
    }

    /// Run `callback` on the loop every `interval`. Not counted as pending.
    pub fn schedule_repeating<F>(&self, interval: Duration, callback: F) -> Result<TaskHandle>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.scheduler.schedule_repeating(interval, callback)
    }

    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.scheduler.cancel(handle)
    }

    /// `setTimeout(cb, delay_ms)`
    pub fn set_timeout<F>(&self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.context
            .timers()
            .set_timeout(Duration::from_millis(delay_ms), callback)
    }

    /// `setInterval(cb, interval_ms)`
    pub fn set_interval<F>(&self, interval_ms: u64, callback: F) -> TimerId
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.context
            .timers()
            .set_interval(Duration::from_millis(interval_ms), callback)
    }

    pub fn clear_timeout(&self, id: TimerId) -> bool {
        self.context.timers().clear_timeout(id)
    }

    pub fn clear_interval(&self, id: TimerId) -> bool {
        self.context.timers().clear_interval(id)
    }

    /// Run blocking `work` off the loop and deliver its result to
    /// `on_complete` on the loop. Counted as pending until `on_complete`
    /// returns.
    pub fn run_blocking<T, W, C>(&self, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) -> Result<()> + Send + 'static,
    {
        self.context
            .adapter()
            .spawn_blocking("runtime.runBlocking", work, on_complete)
    }

    // ---------------------------------------------------------------------
    // Idle and lifecycle
    // ---------------------------------------------------------------------

    /// Block until no operation is pending or `timeout` elapses.
    ///
    /// On the loop thread nothing could complete while it blocked, so the
    /// current state is returned without waiting.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        if self.scheduler.is_loop_thread() {
            tracing::error!("wait_for_idle called on the event loop thread; not blocking");
            return self.idle.is_idle();
        }
        self.idle.wait_for_idle(timeout)
    }

    /// Load a built-in module by name (`"fs"`, `"node:http"`, ...)
    pub fn require(&self, name: &str) -> Result<Builtin> {
        let mut modules = self.modules.lock();
        if let Some(key) = Builtin::canonical_name(name) {
            if let Some(module) = modules.get(key) {
                return Ok(module.clone());
            }
        }
        let module = Builtin::load(name, self.context.clone())?;
        tracing::debug!(module = module.name(), "built-in module loaded");
        modules.insert(module.name(), module.clone());
        Ok(module)
    }

    /// Handle for built-in modules and embedder callbacks
    pub fn context(&self) -> HostContext {
        self.context.clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Cancel every timer, then stop the loop and worker pool within the
    /// configured grace period. Idempotent.
    pub fn shutdown(&self) {
        if self.scheduler.is_shut_down() {
            return;
        }
        let cleared = self.context.timers().clear_all();
        tracing::debug!(cleared, pending = self.counter.count(), "runtime shutting down");
        self.scheduler.shutdown(self.config.shutdown_grace());
        self.modules.lock().clear();
    }

    pub(crate) fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
