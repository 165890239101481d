//! Event Loop and Async Operation Lifecycle
//!
//! The core of the host runtime: it tracks every outstanding asynchronous
//! operation, runs script-visible callbacks on a single designated loop
//! thread, runs blocking I/O on a bounded worker pool, and tells the embedder
//! when a script and everything it started has finished.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`PendingOperationCounter`] | in-flight operation count, the idle signal |
//! | [`TaskScheduler`] | loop thread, timer heap, worker pool |
//! | [`IdleWaiter`] | block until the count reaches zero, with a timeout |
//! | [`TimerRegistry`] | `setTimeout`/`setInterval` ids over scheduler tasks |
//! | [`AsyncModuleAdapter`] | the increment/offload/callback/decrement contract |
//!
//! There is no ordering guarantee across sources: a timer callback and a
//! file-read completion may run in either order.

pub mod adapter;
pub mod counter;
pub mod idle;
mod pool;
pub mod scheduler;
pub mod timers;

pub use adapter::AsyncModuleAdapter;
pub use counter::{PendingOperation, PendingOperationCounter};
pub use idle::IdleWaiter;
pub use scheduler::{log_reporter, ErrorReporter, SchedulerStats, TaskHandle, TaskScheduler};
pub use timers::{TimerId, TimerKind, TimerRegistry};
