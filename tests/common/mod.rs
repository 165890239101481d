//! Shared test helpers for integration tests

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidepool::event_loop::ErrorReporter;
use tidepool::{Error, Runtime, RuntimeConfig};

/// Generous upper bound for anything that should finish "soon"
#[allow(dead_code)]
pub const PATIENCE: Duration = Duration::from_secs(5);

/// A small runtime suitable for tests
pub fn runtime() -> Runtime {
    Runtime::with_config(test_config()).expect("runtime should start")
}

/// Configuration with a small pool and short timeouts
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_worker_threads(2)
        .with_queue_capacity(64)
        .with_idle_timeout(PATIENCE)
        .with_interactive_idle_timeout(Duration::from_millis(250))
        .with_shutdown_grace(Duration::from_secs(1))
}

/// A runtime whose uncaught callback errors are collected as strings
#[allow(dead_code)]
pub fn recording_runtime() -> (Runtime, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let reporter: ErrorReporter = Arc::new(move |err: &Error| sink.lock().push(err.to_string()));
    let runtime = Runtime::with_reporter(test_config(), reporter).expect("runtime should start");
    (runtime, seen)
}
