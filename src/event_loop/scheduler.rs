//! Task scheduler
//!
//! One designated loop thread owns every script-visible callback invocation.
//! Immediate, delayed and repeating tasks wait in a min-heap keyed by due
//! time; blocking work runs on the worker pool and its completion is
//! marshalled back to the loop through the same command channel before the
//! caller's handler runs.
//!
//! ```text
//!   schedule_*() ──► Command::Schedule ─┐
//!                                       ├─► loop thread ─► callback
//!   worker ──────► Command::Run ────────┘
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};

use super::pool::{PoolJob, WorkerPool};
use crate::error::{panic_message, Error, Result};

/// Shortest interval a repeating task may use
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Handles and hooks
// ---------------------------------------------------------------------------

/// Opaque identifier of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Receives errors and panics caught at the loop's callback boundary
pub type ErrorReporter = Arc<dyn Fn(&Error) + Send + Sync>;

/// Reporter that logs through `tracing`
pub fn log_reporter() -> ErrorReporter {
    Arc::new(|err: &Error| tracing::error!(error = %err, "uncaught error in callback"))
}

/// A loop-side job. `OnLoop` when running on the loop thread, `Orphaned`
/// when the loop is gone and the job runs on whichever thread tried to
/// deliver it.
type LoopJob = Box<dyn FnOnce(Dispatch) + Send>;

/// A [`LoopJob`] in flight to the loop. If it is dropped unrun, for instance
/// still queued when the loop's receiver goes away, it runs `Orphaned`.
struct Delivery(Option<LoopJob>);

impl Delivery {
    fn new(job: LoopJob) -> Self {
        Self(Some(job))
    }

    fn run(mut self, dispatch: Dispatch) {
        if let Some(job) = self.0.take() {
            job(dispatch);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(job) = self.0.take() {
            tracing::warn!("event loop stopped with a job still queued; running it off the loop");
            job(Dispatch::Orphaned);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    OnLoop,
    Orphaned,
}

type Work = Box<dyn FnMut() -> Result<()> + Send>;

enum Command {
    Schedule(ScheduledTask),
    Run(Delivery),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Snapshot of scheduler activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub tasks_scheduled: u64,
    pub tasks_fired: u64,
    pub tasks_cancelled: u64,
    pub callback_failures: u64,
    pub blocking_submitted: u64,
    pub blocking_completed: u64,
    pub blocking_rejected: u64,
}

#[derive(Default)]
struct StatCounters {
    tasks_scheduled: AtomicU64,
    tasks_fired: AtomicU64,
    tasks_cancelled: AtomicU64,
    callback_failures: AtomicU64,
    blocking_submitted: AtomicU64,
    blocking_completed: AtomicU64,
    blocking_rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatCounters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_fired: self.tasks_fired.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            blocking_submitted: self.blocking_submitted.load(Ordering::Relaxed),
            blocking_completed: self.blocking_completed.load(Ordering::Relaxed),
            blocking_rejected: self.blocking_rejected.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled tasks
// ---------------------------------------------------------------------------

struct ScheduledTask {
    handle: TaskHandle,
    due: Instant,
    /// Submission order; breaks ties between equal due times
    seq: u64,
    interval: Option<Duration>,
    work: Work,
    cancelled: Arc<AtomicBool>,
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // reversed: BinaryHeap is a max-heap
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

/// State shared between the scheduler front end and the loop thread
struct Shared {
    /// Live tasks and their cancellation flags
    tasks: Mutex<HashMap<TaskHandle, Arc<AtomicBool>>>,
    next_id: AtomicU64,
    stats: StatCounters,
    reporter: ErrorReporter,
}

impl Shared {
    fn register(&self) -> (TaskHandle, Arc<AtomicBool>) {
        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let flag = Arc::new(AtomicBool::new(false));
        self.tasks.lock().insert(handle, Arc::clone(&flag));
        (handle, flag)
    }

    fn forget(&self, handle: TaskHandle) {
        self.tasks.lock().remove(&handle);
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        match self.tasks.lock().remove(&handle) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                bump(&self.stats.tasks_cancelled);
                tracing::trace!(%handle, "task cancelled");
                true
            }
            None => false,
        }
    }

    /// Run a script-visible callback, catching errors and panics so one bad
    /// callback cannot take the loop down.
    fn invoke(&self, callback: impl FnOnce() -> Result<()>) {
        let failure = match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => Error::CallbackPanicked(panic_message(payload.as_ref())),
        };
        bump(&self.stats.callback_failures);
        (self.reporter)(&failure);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns the loop thread and the blocking worker pool
pub struct TaskScheduler {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    pool: WorkerPool,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    loop_thread_id: ThreadId,
    stopped: AtomicBool,
    seq: AtomicU64,
}

impl TaskScheduler {
    /// Start a loop thread and a pool of `workers` threads whose queue holds
    /// at most `queue_capacity` jobs
    pub fn new(workers: usize, queue_capacity: usize, reporter: ErrorReporter) -> Result<Self> {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::default()),
            next_id: AtomicU64::new(1),
            stats: StatCounters::default(),
            reporter,
        });

        let pool = WorkerPool::new(workers, queue_capacity)?;
        let (commands, receiver) = channel::unbounded();

        let loop_shared = Arc::clone(&shared);
        let loop_thread = thread::Builder::new()
            .name("tidepool-loop".to_string())
            .spawn(move || run_loop(loop_shared, receiver))?;
        let loop_thread_id = loop_thread.thread().id();

        tracing::debug!(workers, queue_capacity, "scheduler started");
        Ok(Self {
            shared,
            commands,
            pool,
            loop_thread: Mutex::new(Some(loop_thread)),
            loop_thread_id,
            stopped: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        })
    }

    /// Run `work` on the loop thread at the next iteration
    pub fn schedule_immediate<F>(&self, work: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.schedule_after(Duration::ZERO, work)
    }

    /// Run `work` on the loop thread no earlier than `delay` from now
    pub fn schedule_after<F>(&self, delay: Duration, work: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut work = Some(work);
        self.submit(
            delay,
            None,
            Box::new(move || match work.take() {
                Some(work) => work(),
                None => Ok(()),
            }),
        )
    }

    /// Run `work` on the loop thread every `interval` until cancelled
    pub fn schedule_repeating<F>(&self, interval: Duration, work: F) -> Result<TaskHandle>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        self.submit(interval, Some(interval), Box::new(work))
    }

    fn submit(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        work: Work,
    ) -> Result<TaskHandle> {
        if self.stopped.load(Ordering::Acquire) {
            tracing::warn!("task submitted after scheduler shutdown");
            return Err(Error::SchedulerShutdown);
        }

        let (handle, cancelled) = self.shared.register();
        let now = Instant::now();
        let task = ScheduledTask {
            handle,
            due: now
                .checked_add(delay)
                .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365)),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            interval,
            work,
            cancelled,
        };

        if self.commands.send(Command::Schedule(task)).is_err() {
            self.shared.forget(handle);
            tracing::warn!(%handle, "event loop has stopped; task dropped");
            return Err(Error::SchedulerShutdown);
        }

        bump(&self.shared.stats.tasks_scheduled);
        tracing::trace!(%handle, ?delay, repeating = interval.is_some(), "task scheduled");
        Ok(handle)
    }

    /// Prevent any future firing of `handle`.
    ///
    /// A firing already dispatched on the loop runs to completion. Returns
    /// `false` for unknown, finished or already-cancelled handles.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.shared.cancel(handle)
    }

    /// Whether `handle` still refers to a task that may fire
    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.shared.tasks.lock().contains_key(&handle)
    }

    /// Run `job` on the loop thread once, ahead of any timer that is not yet
    /// due. Unlike [`schedule_immediate`](Self::schedule_immediate) there is
    /// no handle and no way to cancel it.
    pub(crate) fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::SchedulerShutdown);
        }
        let shared = Arc::clone(&self.shared);
        let job: LoopJob = Box::new(move |dispatch| {
            if dispatch == Dispatch::OnLoop {
                shared.invoke(job);
            }
        });
        // dropped unsent or unrun, an Orphaned post is a no-op
        self.commands
            .send(Command::Run(Delivery::new(job)))
            .map_err(|_| Error::SchedulerShutdown)
    }

    /// Run blocking `work` on the worker pool and deliver its result to
    /// `on_complete` on the loop thread.
    ///
    /// `on_complete` is always invoked exactly once: with the work's result,
    /// with [`Error::Cancelled`] if the handle was cancelled first, or with the
    /// scheduling failure if the work could not be queued.
    pub fn run_blocking<T, W, C>(&self, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) -> Result<()> + Send + 'static,
    {
        let (handle, cancelled) = self.shared.register();
        let shared = Arc::clone(&self.shared);
        let commands = self.commands.clone();

        let job: PoolJob = Box::new(move |rejected: Option<Error>| {
            let result = match rejected {
                Some(err) => Err(err),
                None => catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                    Err(Error::WorkerPanicked(panic_message(payload.as_ref())))
                }),
            };

            let loop_shared = Arc::clone(&shared);
            let completion: LoopJob = Box::new(move |dispatch| {
                loop_shared.forget(handle);
                let result = match dispatch {
                    Dispatch::Orphaned => Err(Error::SchedulerShutdown),
                    Dispatch::OnLoop if cancelled.load(Ordering::Acquire) => Err(Error::Cancelled),
                    Dispatch::OnLoop => result,
                };
                bump(&loop_shared.stats.blocking_completed);
                loop_shared.invoke(|| on_complete(result));
            });
            deliver(&commands, completion);
        });

        bump(&self.shared.stats.blocking_submitted);
        let job = if self.stopped.load(Ordering::Acquire) {
            Err((job, Error::SchedulerShutdown))
        } else {
            self.pool.submit(job)
        };
        if let Err((job, err)) = job {
            tracing::warn!(%handle, error = %err, "blocking work rejected");
            bump(&self.shared.stats.blocking_rejected);
            job(Some(err));
        }
        handle
    }

    /// Whether the caller is the designated loop thread
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread_id
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.snapshot()
    }

    /// Stop the loop and the worker pool.
    ///
    /// Pending tasks are cancelled, completions already queued are delivered,
    /// and threads still busy after `grace` are detached rather than waited
    /// for. Safe to call more than once and from the loop thread.
    pub fn shutdown(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(?grace, "scheduler shutting down");

        let mut threads = self.pool.close();
        let _ = self.commands.send(Command::Shutdown);
        if let Some(loop_thread) = self.loop_thread.lock().take() {
            threads.push(loop_thread);
        }

        if self.is_loop_thread() {
            // The loop exits once the current callback returns.
            return;
        }

        let deadline = Instant::now() + grace;
        while threads.iter().any(|t| !t.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        for handle in threads {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
                tracing::warn!(
                    thread = %name,
                    "thread still busy after shutdown grace period; detaching"
                );
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(2));
    }
}

/// Hand `job` to the loop. Whether the send fails or the loop stops before
/// reaching it, the job still runs exactly once.
fn deliver(commands: &Sender<Command>, job: LoopJob) {
    if let Err(err) = commands.send(Command::Run(Delivery::new(job))) {
        if let Command::Run(delivery) = err.into_inner() {
            tracing::warn!("event loop has stopped; delivering completion on the calling thread");
            delivery.run(Dispatch::Orphaned);
        }
    }
}

// ---------------------------------------------------------------------------
// Loop thread
// ---------------------------------------------------------------------------

fn run_loop(shared: Arc<Shared>, commands: Receiver<Command>) {
    let mut timers: BinaryHeap<ScheduledTask> = BinaryHeap::new();
    tracing::trace!("event loop started");

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|task| task.due <= now) {
            if let Some(task) = timers.pop() {
                if let Some(next) = fire(&shared, task, now) {
                    timers.push(next);
                }
            }
        }

        let command = match timers.peek() {
            Some(next) => {
                let wait = next.due.saturating_duration_since(Instant::now());
                match commands.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Schedule(task) => timers.push(task),
            Command::Run(delivery) => delivery.run(Dispatch::OnLoop),
            Command::Shutdown => break,
        }
    }

    // Completions that made it into the queue are delivered; anything
    // still scheduled is cancelled. A completion sent after this drain is
    // dropped with the receiver and runs Orphaned.
    for command in commands.try_iter() {
        match command {
            Command::Run(delivery) => delivery.run(Dispatch::OnLoop),
            Command::Schedule(task) => timers.push(task),
            Command::Shutdown => {}
        }
    }
    for task in timers.drain() {
        shared.cancel(task.handle);
        task.cancelled.store(true, Ordering::Release);
    }
    tracing::trace!("event loop stopped");
}

/// Fire one due task; returns it again if it should repeat
fn fire(shared: &Shared, mut task: ScheduledTask, now: Instant) -> Option<ScheduledTask> {
    if task.cancelled.load(Ordering::Acquire) {
        return None;
    }
    bump(&shared.stats.tasks_fired);
    tracing::trace!(handle = %task.handle, "task firing");

    let Some(interval) = task.interval else {
        shared.forget(task.handle);
        shared.invoke(|| (task.work)());
        return None;
    };

    shared.invoke(|| (task.work)());
    if task.cancelled.load(Ordering::Acquire) {
        return None;
    }

    // Keep the original cadence; if the loop fell behind, skip the missed
    // firings instead of bursting through them.
    let mut next = task.due + interval;
    if next <= now {
        next = now + interval;
    }
    task.due = next;
    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new(2, 16, log_reporter()).unwrap()
    }

    fn recording_reporter() -> (ErrorReporter, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter: ErrorReporter =
            Arc::new(move |err: &Error| sink.lock().push(err.to_string()));
        (reporter, seen)
    }

    #[test]
    fn test_immediate_runs_on_loop_thread() {
        let scheduler = scheduler();
        let (tx, rx) = channel::bounded(1);
        scheduler
            .schedule_immediate(move || {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
                Ok(())
            })
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("tidepool-loop"));
        assert!(!scheduler.is_loop_thread());
    }

    #[test]
    fn test_zero_delay_fires_before_later_delay() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel::bounded(2);

        let (o, t) = (Arc::clone(&order), tx.clone());
        scheduler
            .schedule_after(Duration::from_millis(50), move || {
                o.lock().push("later");
                t.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        let (o, t) = (Arc::clone(&order), tx);
        scheduler
            .schedule_after(Duration::ZERO, move || {
                o.lock().push("now");
                t.send(()).unwrap();
                Ok(())
            })
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), vec!["now", "later"]);
    }

    #[test]
    fn test_equal_due_times_keep_submission_order() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel::unbounded();
        for i in 0..10 {
            let (o, t) = (Arc::clone(&order), tx.clone());
            scheduler
                .schedule_immediate(move || {
                    o.lock().push(i);
                    t.send(()).unwrap();
                    Ok(())
                })
                .unwrap();
        }
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_delay_is_respected() {
        let scheduler = scheduler();
        let (tx, rx) = channel::bounded(1);
        let start = Instant::now();
        scheduler
            .schedule_after(Duration::from_millis(40), move || {
                tx.send(Instant::now()).unwrap();
                Ok(())
            })
            .unwrap();
        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(start) >= Duration::from_millis(40));
    }

    #[test]
    fn test_cancel_one_shot() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let handle = scheduler
            .schedule_after(Duration::from_millis(30), move || {
                f.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(scheduler.is_pending(handle));
        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        thread::sleep(Duration::from_millis(80));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!scheduler.is_pending(handle));
    }

    #[test]
    fn test_cancel_unknown_handle() {
        let scheduler = scheduler();
        assert!(!scheduler.cancel(TaskHandle(9_999)));
    }

    #[test]
    fn test_repeating_until_cancelled() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler
            .schedule_repeating(Duration::from_millis(10), move || {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        while fired.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(scheduler.cancel(handle));
        let at_cancel = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        // at most the firing already dispatched when cancel returned
        assert!(fired.load(Ordering::SeqCst) <= at_cancel + 1);
    }

    #[test]
    fn test_repeating_can_cancel_itself() {
        let scheduler = Arc::new(scheduler());
        let fired = Arc::new(AtomicUsize::new(0));
        let handle_slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));

        let (f, s, slot) = (
            Arc::clone(&fired),
            Arc::downgrade(&scheduler),
            Arc::clone(&handle_slot),
        );
        let handle = scheduler
            .schedule_repeating(Duration::from_millis(5), move || {
                if f.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    if let (Some(s), Some(h)) = (s.upgrade(), *slot.lock()) {
                        s.cancel(h);
                    }
                }
                Ok(())
            })
            .unwrap();
        *handle_slot.lock() = Some(handle);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_errors_and_panics_are_reported() {
        let (reporter, seen) = recording_reporter();
        let scheduler = TaskScheduler::new(1, 4, reporter).unwrap();
        let (tx, rx) = channel::bounded(1);

        scheduler
            .schedule_immediate(|| Err(Error::callback("ReferenceError: x is not defined")))
            .unwrap();
        scheduler.schedule_immediate(|| panic!("boom")).unwrap();
        scheduler
            .schedule_immediate(move || {
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("ReferenceError"));
        assert!(seen[1].contains("boom"));
        assert_eq!(scheduler.stats().callback_failures, 2);
    }

    #[test]
    fn test_run_blocking_marshals_to_loop() {
        let scheduler = scheduler();
        let (tx, rx) = channel::bounded(1);
        scheduler.run_blocking(
            || {
                let worker = thread::current().name().map(str::to_string);
                Ok(worker)
            },
            move |result: Result<Option<String>>| {
                let loop_name = thread::current().name().map(str::to_string);
                tx.send((result.unwrap(), loop_name)).unwrap();
                Ok(())
            },
        );
        let (worker, loop_name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(worker.unwrap().starts_with("tidepool-worker-"));
        assert_eq!(loop_name.as_deref(), Some("tidepool-loop"));
    }

    #[test]
    fn test_run_blocking_propagates_errors_and_panics() {
        let scheduler = scheduler();
        let (tx, rx) = channel::unbounded();

        let t = tx.clone();
        scheduler.run_blocking(
            || -> Result<()> { Err(Error::http("connection refused")) },
            move |result| {
                t.send(result.unwrap_err().to_string()).unwrap();
                Ok(())
            },
        );
        scheduler.run_blocking(
            || -> Result<()> { panic!("disk on fire") },
            move |result| {
                tx.send(result.unwrap_err().to_string()).unwrap();
                Ok(())
            },
        );

        let mut messages = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        messages.sort();
        assert!(messages[0].contains("connection refused"));
        assert!(messages[1].contains("disk on fire"));
    }

    #[test]
    fn test_cancelled_blocking_work_reports_cancelled() {
        let scheduler = scheduler();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (tx, rx) = channel::bounded(1);

        let handle = scheduler.run_blocking(
            move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                Ok(7)
            },
            move |result: Result<i32>| {
                tx.send(matches!(result, Err(Error::Cancelled))).unwrap();
                Ok(())
            },
        );
        assert!(scheduler.cancel(handle));
        gate_tx.send(()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_queue_full_still_invokes_completion() {
        let scheduler = TaskScheduler::new(1, 1, log_reporter()).unwrap();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (tx, rx) = channel::unbounded();

        scheduler.run_blocking(
            move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                Ok(())
            },
            |_| Ok(()),
        );
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.run_blocking(|| Ok(()), |_| Ok(()));

        scheduler.run_blocking(
            || Ok(()),
            move |result: Result<()>| {
                tx.send(matches!(result, Err(Error::QueueFull { capacity: 1 }))).unwrap();
                Ok(())
            },
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(scheduler.stats().blocking_rejected, 1);
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let scheduler = scheduler();
        scheduler.shutdown(Duration::from_secs(2));
        assert!(scheduler.is_shut_down());
        assert!(matches!(
            scheduler.schedule_immediate(|| Ok(())),
            Err(Error::SchedulerShutdown)
        ));

        let (tx, rx) = channel::bounded(1);
        scheduler.run_blocking(
            || Ok(()),
            move |result: Result<()>| {
                tx.send(matches!(result, Err(Error::SchedulerShutdown))).unwrap();
                Ok(())
            },
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_unrun_delivery_runs_orphaned() {
        let (tx, rx) = channel::bounded(1);
        let job: LoopJob = Box::new(move |dispatch| tx.send(dispatch).unwrap());
        drop(Delivery::new(job));
        assert_eq!(rx.try_recv().unwrap(), Dispatch::Orphaned);

        let (tx, rx) = channel::bounded(1);
        let job: LoopJob = Box::new(move |dispatch| tx.send(dispatch).unwrap());
        Delivery::new(job).run(Dispatch::OnLoop);
        assert_eq!(rx.try_recv().unwrap(), Dispatch::OnLoop);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_completion_released_during_shutdown_runs_once() {
        let scheduler = scheduler();
        // far-future timers keep the loop busy while it winds down
        for _ in 0..10_000 {
            scheduler.schedule_after(Duration::from_secs(3_600), || Ok(())).unwrap();
        }
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (tx, rx) = channel::unbounded();

        scheduler.run_blocking(
            move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                Ok(3)
            },
            move |result: Result<i32>| {
                tx.send(matches!(result, Ok(3) | Err(Error::SchedulerShutdown))).unwrap();
                Ok(())
            },
        );
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            let _ = gate_tx.send(());
        });
        scheduler.shutdown(Duration::from_secs(5));
        releaser.join().unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_shutdown_detaches_busy_worker_after_grace() {
        let scheduler = scheduler();
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        scheduler.run_blocking(
            move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_secs(3));
                Ok(())
            },
            |_| Ok(()),
        );
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let start = Instant::now();
        scheduler.shutdown(Duration::from_millis(200));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(1));
        assert!(scheduler.is_shut_down());
    }

    #[test]
    fn test_shutdown_cancels_repeating_tasks() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler
            .schedule_repeating(Duration::from_millis(5), move || {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        scheduler.shutdown(Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!scheduler.is_pending(handle));

        let after = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = scheduler();
        scheduler.shutdown(Duration::from_millis(500));
        scheduler.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_stats_track_activity() {
        let scheduler = scheduler();
        let (tx, rx) = channel::bounded(1);
        let handle = scheduler
            .schedule_after(Duration::from_secs(60), || Ok(()))
            .unwrap();
        scheduler.cancel(handle);
        scheduler
            .schedule_immediate(move || {
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.tasks_scheduled, 2);
        assert_eq!(stats.tasks_cancelled, 1);
        assert_eq!(stats.tasks_fired, 1);
    }

    #[test]
    fn test_post_runs_on_loop_and_fails_after_shutdown() {
        let scheduler = scheduler();
        let (tx, rx) = channel::bounded(1);
        scheduler
            .post(move || {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
                Ok(())
            })
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("tidepool-loop"));

        scheduler.shutdown(Duration::from_secs(1));
        assert!(matches!(scheduler.post(|| Ok(())), Err(Error::SchedulerShutdown)));
    }
}
