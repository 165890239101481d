//! Error types for the Tidepool host runtime

use std::any::Any;
use thiserror::Error;

/// Main error type for Tidepool
///
/// Scheduling failures, work failures and callback failures all travel
/// through this one type so that a completion handler can always be invoked
/// with *some* result, whatever went wrong.
#[derive(Error, Debug)]
pub enum Error {
    /// The scheduler has been shut down and no longer accepts work
    #[error("SchedulerShutdown: the event loop is no longer running")]
    SchedulerShutdown,

    /// The blocking worker queue is at capacity
    #[error("QueueFull: worker queue is full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    /// The operation was cancelled before its result was delivered
    #[error("Cancelled: operation was cancelled")]
    Cancelled,

    /// A decrement was issued without a matching increment
    #[error("CounterUnderflow: pending operation count decremented below zero")]
    CounterUnderflow,

    /// The caller tried to block the loop thread on work only the loop can finish
    #[error("LoopThreadBlocked: {0} cannot be called from the event loop thread")]
    LoopThreadBlocked(&'static str),

    /// A script-visible callback reported a failure
    #[error("CallbackError: {0}")]
    CallbackFailed(String),

    /// A script-visible callback panicked
    #[error("CallbackPanic: {0}")]
    CallbackPanicked(String),

    /// Blocking work panicked on a worker thread
    #[error("WorkerPanic: {0}")]
    WorkerPanicked(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// HTTP protocol error
    #[error("HttpError: {0}")]
    Http(String),

    /// Malformed or unsupported URL
    #[error("InvalidUrl: {0}")]
    InvalidUrl(String),

    /// `require` of a module the runtime does not provide
    #[error("ModuleError: cannot find module '{0}'")]
    ModuleNotFound(String),

    /// Invalid runtime configuration
    #[error("ConfigError: {0}")]
    Config(String),
}

impl Error {
    /// Create a callback failure from any displayable message
    pub fn callback(message: impl Into<String>) -> Self {
        Error::CallbackFailed(message.into())
    }

    /// Create an HTTP error
    pub fn http(message: impl Into<String>) -> Self {
        Error::Http(message.into())
    }

    /// Whether this error was produced by the scheduler rather than by the work itself
    pub fn is_scheduling_failure(&self) -> bool {
        matches!(
            self,
            Error::SchedulerShutdown | Error::QueueFull { .. } | Error::Cancelled
        )
    }
}

/// Extract a readable message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Result type alias for Tidepool operations
pub type Result<T> = std::result::Result<T, Error>;
