//! Runtime Configuration
//!
//! Tunables for the event loop, worker pool and idle detection. A
//! configuration can be built in code, loaded from a JSON document, and
//! adjusted from the environment.
//!
//! ```json
//! {
//!   "workerThreads": 8,
//!   "idleTimeoutMs": 60000
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding [`RuntimeConfig::worker_threads`]
pub const ENV_WORKERS: &str = "TIDEPOOL_WORKERS";
/// Environment variable overriding [`RuntimeConfig::idle_timeout_ms`]
pub const ENV_IDLE_TIMEOUT_MS: &str = "TIDEPOOL_IDLE_TIMEOUT_MS";

/// Configuration for a [`Runtime`](crate::Runtime)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Number of threads in the blocking I/O pool
    pub worker_threads: usize,
    /// Maximum number of blocking jobs waiting for a worker
    pub queue_capacity: usize,
    /// How long a run-to-completion waits for outstanding work
    pub idle_timeout_ms: u64,
    /// How long an interactive (REPL line) evaluation waits for outstanding work
    pub interactive_idle_timeout_ms: u64,
    /// How long shutdown waits for the loop and workers to stop
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: 1024,
            idle_timeout_ms: 30_000,
            interactive_idle_timeout_ms: 1_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a JSON string. Missing keys keep their defaults.
    pub fn load(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::load(&json)
    }

    /// Apply `TIDEPOOL_*` environment overrides on top of this configuration
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.worker_threads = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a number, got '{}'", ENV_WORKERS, raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT_MS) {
            self.idle_timeout_ms = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a number, got '{}'", ENV_IDLE_TIMEOUT_MS, raw))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Set the worker pool size
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Set the worker queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the run-to-completion idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = millis(timeout);
        self
    }

    /// Set the interactive idle timeout
    pub fn with_interactive_idle_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_idle_timeout_ms = millis(timeout);
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = millis(grace);
        self
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Config("workerThreads must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queueCapacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn interactive_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.interactive_idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
