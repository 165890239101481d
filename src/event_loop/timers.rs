//! Timer registry
//!
//! Backs `setTimeout`/`setInterval`/`clearTimeout`/`clearInterval`. Each timer
//! id maps to a scheduler task; the map entry doubles as the arbiter of the
//! pending-operation decrement: whoever removes the entry (the firing of a
//! timeout, or a clear) owns the decrement, so it happens exactly once.
//!
//! Counting discipline:
//! - timeout: +1 when registered, -1 after its callback returns (or when it
//!   is cleared before firing)
//! - interval: +1 when registered, -1 only when cleared

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;

use super::counter::PendingOperationCounter;
use super::scheduler::{TaskHandle, TaskScheduler};
use crate::error::Result;

/// Script-visible timer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TimerId {
    fn from(id: u64) -> Self {
        TimerId(id)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// One-shot (`setTimeout`)
    Timeout,
    /// Repeating (`setInterval`)
    Interval,
}

#[derive(Debug)]
struct TimerEntry {
    kind: TimerKind,
    /// `None` while the scheduler call that creates the task is in flight
    handle: Option<TaskHandle>,
}

#[derive(Debug)]
struct Registry {
    next_id: u64,
    entries: HashMap<TimerId, TimerEntry>,
}

/// Maps timer ids to scheduled tasks
#[derive(Clone)]
pub struct TimerRegistry {
    registry: Arc<Mutex<Registry>>,
    scheduler: Arc<TaskScheduler>,
    counter: Arc<PendingOperationCounter>,
}

impl TimerRegistry {
    pub fn new(scheduler: Arc<TaskScheduler>, counter: Arc<PendingOperationCounter>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                entries: HashMap::default(),
            })),
            scheduler,
            counter,
        }
    }

    /// Run `callback` once after `delay`
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.register(TimerKind::Timeout);
        let registry = Arc::clone(&self.registry);
        let counter = Arc::clone(&self.counter);

        let scheduled = self.scheduler.schedule_after(delay, move || {
            if registry.lock().entries.remove(&id).is_none() {
                // cleared before it fired
                return Ok(());
            }
            let _op = counter.adopt();
            callback()
        });
        self.attach(id, scheduled);
        id
    }

    /// Run `callback` every `interval` until cleared
    pub fn set_interval<F>(&self, interval: Duration, mut callback: F) -> TimerId
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let id = self.register(TimerKind::Interval);
        let registry = Arc::clone(&self.registry);

        let scheduled = self.scheduler.schedule_repeating(interval, move || {
            if !registry.lock().entries.contains_key(&id) {
                return Ok(());
            }
            callback()
        });
        self.attach(id, scheduled);
        id
    }

    /// Cancel a timeout. Unknown or already fired ids are ignored.
    pub fn clear_timeout(&self, id: TimerId) -> bool {
        self.clear(id)
    }

    /// Cancel an interval. Unknown or already cleared ids are ignored.
    pub fn clear_interval(&self, id: TimerId) -> bool {
        self.clear(id)
    }

    /// Whether `id` is still armed
    pub fn is_active(&self, id: TimerId) -> bool {
        self.registry.lock().entries.contains_key(&id)
    }

    /// The kind of an armed timer
    pub fn kind(&self, id: TimerId) -> Option<TimerKind> {
        self.registry.lock().entries.get(&id).map(|entry| entry.kind)
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every armed timer and release its pending count.
    /// Returns how many timers were cleared.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<TimerEntry> = {
            let mut registry = self.registry.lock();
            registry.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            self.release(entry);
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cleared all timers");
        }
        drained.len()
    }

    fn register(&self, kind: TimerKind) -> TimerId {
        // Count first: a clear can only decrement once the entry is visible.
        self.counter.increment();
        let mut registry = self.registry.lock();
        let id = TimerId(registry.next_id);
        registry.next_id += 1;
        registry.entries.insert(id, TimerEntry { kind, handle: None });
        tracing::trace!(%id, ?kind, "timer registered");
        id
    }

    /// Record the task backing `id`, or clean up if scheduling failed or the
    /// timer was cleared while it was being scheduled.
    fn attach(&self, id: TimerId, scheduled: Result<TaskHandle>) {
        match scheduled {
            Ok(handle) => {
                let mut registry = self.registry.lock();
                match registry.entries.get_mut(&id) {
                    Some(entry) => entry.handle = Some(handle),
                    None => {
                        drop(registry);
                        self.scheduler.cancel(handle);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%id, error = %err, "timer could not be scheduled");
                let removed = self.registry.lock().entries.remove(&id);
                if let Some(entry) = removed {
                    self.release(&entry);
                }
            }
        }
    }

    fn clear(&self, id: TimerId) -> bool {
        let removed = self.registry.lock().entries.remove(&id);
        match removed {
            Some(entry) => {
                tracing::trace!(%id, kind = ?entry.kind, "timer cleared");
                self.release(&entry);
                true
            }
            None => false,
        }
    }

    fn release(&self, entry: &TimerEntry) {
        if let Some(handle) = entry.handle {
            self.scheduler.cancel(handle);
        }
        // Errors are already logged by the counter.
        let _ = self.counter.decrement();
    }
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("armed", &self.len())
            .finish()
    }
}
