//! Script driver
//!
//! Runs one unit of script work on the event loop and then waits for
//! everything it started. A top-level script waits up to the
//! run-to-completion timeout; a REPL line waits up to the shorter
//! interactive timeout.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crossbeam::channel;

use super::Runtime;
use crate::error::{panic_message, Error, Result};

/// How an evaluation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The script and all work it started finished
    Idle,
    /// The timeout elapsed with work still outstanding
    Pending { outstanding: usize },
}

impl Completion {
    pub fn is_idle(&self) -> bool {
        matches!(self, Completion::Idle)
    }
}

/// Drives script evaluation against a [`Runtime`]
pub struct ScriptDriver<'rt> {
    runtime: &'rt Runtime,
}

impl<'rt> ScriptDriver<'rt> {
    pub fn new(runtime: &'rt Runtime) -> Self {
        Self { runtime }
    }

    /// Evaluate a top-level script and wait up to the configured
    /// run-to-completion timeout
    pub fn run_script<F>(&self, script: F) -> Result<Completion>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.run(script, self.runtime.config().idle_timeout())
    }

    /// Evaluate one REPL line and wait up to the interactive timeout
    pub fn run_line<F>(&self, line: F) -> Result<Completion>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.run(line, self.runtime.config().interactive_idle_timeout())
    }

    /// Evaluate `work` on the loop thread, then wait up to `timeout` for idle.
    ///
    /// An error or panic from `work` itself is returned; errors from
    /// callbacks it schedules go to the runtime's error reporter.
    pub fn run<F>(&self, work: F, timeout: Duration) -> Result<Completion>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.runtime.scheduler().is_loop_thread() {
            return Err(Error::LoopThreadBlocked("ScriptDriver::run"));
        }

        let (tx, rx) = channel::bounded(1);
        self.runtime.scheduler().post(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                Err(Error::CallbackPanicked(panic_message(payload.as_ref())))
            });
            let _ = tx.send(outcome);
            Ok(())
        })?;

        // The sender is dropped unsent only if the loop stopped first.
        rx.recv().map_err(|_| Error::SchedulerShutdown)??;

        if self.runtime.wait_for_idle(timeout) {
            Ok(Completion::Idle)
        } else {
            let outstanding = self.runtime.pending_operations_count();
            tracing::warn!(outstanding, ?timeout, "script did not reach idle before timeout");
            Ok(Completion::Pending { outstanding })
        }
    }
}
