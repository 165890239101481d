//! Tidepool: an embeddable host runtime for JavaScript engines
//!
//! Tidepool gives a third-party JavaScript engine the environment Node.js
//! scripts expect: an event loop, `setTimeout`/`setInterval`, async `fs` and
//! `http` built-ins, and a reliable answer to "has this script finished?".
//! The engine itself is supplied by the embedder.
//!
//! # Features
//!
//! - **Single loop thread**: every script-visible callback runs on one
//!   designated thread
//! - **Blocking I/O off the loop**: a bounded worker pool runs file and
//!   network work
//! - **Idle detection**: a pending-operation counter and a waiter that
//!   blocks until everything a script started has completed
//! - **Isolated runtimes**: no globals, several runtimes per process
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use tidepool::Runtime;
//!
//! fn main() -> tidepool::Result<()> {
//!     let runtime = Runtime::new()?;
//!     let fs = runtime.require("fs")?;
//!     if let Some(fs) = fs.as_fs() {
//!         fs.read_to_string("Cargo.toml", |text| {
//!             println!("{} bytes", text?.len());
//!             Ok(())
//!         });
//!     }
//!     runtime.wait_for_idle(Duration::from_secs(5));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`event_loop`], [`runtime`], [`error`](Error) |
//! | **Built-ins** | [`native`] |
//! | **Embedding** | [`config`], [`prelude`] |
// Clippy configuration for the Tidepool runtime.
//
// - type_complexity: completion callbacks are boxed `FnOnce(Result<T>)` trait objects
#![allow(clippy::type_complexity)]

pub mod config;
pub mod event_loop;
pub mod native;
pub mod prelude;
pub mod runtime;

mod error;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use event_loop::{SchedulerStats, TaskHandle, TimerId};
pub use runtime::{Completion, HostContext, Runtime, ScriptDriver};

/// Tidepool version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
