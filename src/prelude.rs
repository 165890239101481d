//! Prelude module for convenient imports
//!
//! The types an embedder touches most, in one import:
//!
//! ```no_run
//! use tidepool::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let runtime = Runtime::new()?;
//!     let completion = ScriptDriver::new(&runtime).run_script(|| Ok(()))?;
//!     assert_eq!(completion, Completion::Idle);
//!     Ok(())
//! }
//! ```

// Runtime
pub use crate::runtime::{Completion, HostContext, Runtime, ScriptDriver};

// Configuration
pub use crate::config::RuntimeConfig;

// Error handling
pub use crate::error::{Error, Result};

// Event loop
pub use crate::event_loop::{
    ErrorReporter, IdleWaiter, PendingOperation, PendingOperationCounter, SchedulerStats,
    TaskHandle, TaskScheduler, TimerId, TimerKind, TimerRegistry,
};

// Built-in modules
pub use crate::native::{Builtin, FsModule, HttpModule};
