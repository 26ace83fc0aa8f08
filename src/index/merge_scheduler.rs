//! Background execution of merges.
//!
//! The writer hands every merge it wants to run to a [`MergeScheduler`] as a
//! boxed job. The concurrent scheduler runs jobs on a small pool of named
//! worker threads fed through a channel, so `add_document` never waits for
//! a merge. The serial scheduler runs a job in the submitting thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, XiphosError};

/// A unit of background work.
pub type MergeJob = Box<dyn FnOnce() + Send + 'static>;

/// How merges are executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeSchedulerConfig {
    /// Run merges on up to `max_threads` background threads.
    Concurrent { max_threads: usize },
    /// Run merges in the thread that triggered them.
    Serial,
    /// Never run natural merges. Forced merges still run.
    NoMerges,
}

impl Default for MergeSchedulerConfig {
    fn default() -> Self {
        MergeSchedulerConfig::Concurrent {
            max_threads: (num_cpus::get() / 2).clamp(1, 4),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Decrements the pending count even if the job panics.
struct PendingGuard<'a>(&'a Pending);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

#[derive(Debug)]
pub struct MergeScheduler {
    config: MergeSchedulerConfig,
    sender: Mutex<Option<Sender<MergeJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    pending: Arc<Pending>,
    running: Arc<AtomicBool>,
}

impl MergeScheduler {
    /// Create the scheduler and start its workers.
    pub fn new(config: MergeSchedulerConfig) -> Result<Self> {
        let scheduler = MergeScheduler {
            config: config.clone(),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            pending: Arc::new(Pending::default()),
            running: Arc::new(AtomicBool::new(true)),
        };

        if let MergeSchedulerConfig::Concurrent { max_threads } = config {
            if max_threads == 0 {
                return Err(XiphosError::invalid_argument(
                    "concurrent merge scheduler needs at least one thread",
                ));
            }
            let (sender, receiver) = unbounded();
            let mut workers = scheduler.workers.lock();
            for worker_id in 0..max_threads {
                workers.push(scheduler.spawn_worker(worker_id, receiver.clone())?);
            }
            drop(workers);
            *scheduler.sender.lock() = Some(sender);
        }
        Ok(scheduler)
    }

    /// Whether natural merges should be selected at all.
    pub fn runs_merges(&self) -> bool {
        self.config != MergeSchedulerConfig::NoMerges
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        receiver: Receiver<MergeJob>,
    ) -> Result<thread::JoinHandle<()>> {
        let pending = Arc::clone(&self.pending);

        let handle = thread::Builder::new()
            .name(format!("xiphos-merge-{worker_id}"))
            .spawn(move || {
                // Ends once the sender is dropped and the queue is drained.
                for job in receiver.iter() {
                    run_job(job, &pending);
                }
                debug!(worker_id, "merge worker stopped");
            })?;
        Ok(handle)
    }

    /// Run `job` according to the configured strategy. Returns false if the
    /// scheduler no longer accepts work.
    pub fn submit(&self, job: MergeJob) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.pending.increment();

        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => {
                if let Err(returned) = sender.send(job) {
                    // Workers are gone; nothing will run the job.
                    drop(returned);
                    self.pending.decrement();
                    return false;
                }
            }
            None => run_job(job, &self.pending),
        }
        true
    }

    /// Block until every submitted job has finished.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Stop accepting jobs, let queued jobs finish and join the workers.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.sender.lock().take();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // A job may drop the last handle to its writer on a worker.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("merge worker panicked");
            }
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_job(job: MergeJob, pending: &Pending) {
    let _guard = PendingGuard(pending);
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
        warn!("merge job panicked");
    }
}
