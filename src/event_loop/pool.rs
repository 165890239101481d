//! Bounded worker pool for blocking operations
//!
//! File reads, directory listings and network requests run here so that the
//! loop thread never blocks. Jobs never touch script-visible state; they hand
//! their result back to the loop themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A unit of blocking work.
///
/// Called with `None` on a worker, or with the rejection reason when the job
/// never reached one (queue full, pool closed). Either way it is called
/// exactly once.
pub(crate) type PoolJob = Box<dyn FnOnce(Option<Error>) + Send>;

pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<PoolJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of at most `capacity` jobs
    pub(crate) fn new(size: usize, capacity: usize) -> Result<Self> {
        let (sender, receiver) = channel::bounded::<PoolJob>(capacity);
        let closing = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let closing = Arc::clone(&closing);
            let handle = thread::Builder::new()
                .name(format!("tidepool-worker-{}", index))
                .spawn(move || worker_main(index, receiver, closing))?;
            workers.push(handle);
        }

        tracing::debug!(size, capacity, "worker pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            closing,
            capacity,
        })
    }

    /// Queue a job without blocking.
    ///
    /// On rejection the job is handed back together with the reason so the
    /// caller can still deliver a result.
    pub(crate) fn submit(&self, job: PoolJob) -> std::result::Result<(), (PoolJob, Error)> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err((job, Error::SchedulerShutdown));
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err((
                job,
                Error::QueueFull {
                    capacity: self.capacity,
                },
            )),
            Err(TrySendError::Disconnected(job)) => Err((job, Error::SchedulerShutdown)),
        }
    }

    /// Stop accepting work. Queued jobs that no worker has started yet are
    /// rejected with [`Error::SchedulerShutdown`]; running jobs finish.
    pub(crate) fn close(&self) -> Vec<JoinHandle<()>> {
        self.closing.store(true, Ordering::Release);
        self.sender.lock().take();
        std::mem::take(&mut *self.workers.lock())
    }
}

fn worker_main(index: usize, receiver: Receiver<PoolJob>, closing: Arc<AtomicBool>) {
    tracing::trace!(worker = index, "worker started");
    while let Ok(job) = receiver.recv() {
        if closing.load(Ordering::Acquire) {
            job(Some(Error::SchedulerShutdown));
        } else {
            job(None);
        }
    }
    tracing::trace!(worker = index, "worker stopped");
}
