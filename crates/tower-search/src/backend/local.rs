//! In-process thread pool backend.
//!
//! Workers pull jobs from a shared channel and push completions to a second
//! one that only the scheduler reads. A cancelled job that has not started is
//! skipped; one that is already running finishes and its completion is
//! dropped on the floor in `await_any`.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{Backend, BackendError, Completion, TaskId};
use crate::trial::{TrialRunner, TrialSpec};

struct Job {
    task: TaskId,
    spec: Arc<TrialSpec>,
}

#[derive(Default)]
struct Shared {
    cancelled: Mutex<HashSet<TaskId>>,
    closing: AtomicBool,
}

impl Shared {
    fn take_cancelled(&self, task: TaskId) -> bool {
        self.cancelled
            .lock()
            .map(|mut set| set.remove(&task))
            .unwrap_or(false)
    }

    fn mark_cancelled(&self, tasks: impl IntoIterator<Item = TaskId>) {
        if let Ok(mut set) = self.cancelled.lock() {
            set.extend(tasks);
        }
    }
}

pub struct LocalBackend {
    jobs: Option<Sender<Job>>,
    completions: Receiver<Completion>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_task: u64,
}

impl LocalBackend {
    pub fn new(runner: Arc<dyn TrialRunner>, workers: Option<usize>) -> Result<Self, BackendError> {
        let count = workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<Completion>();
        let shared = Arc::new(Shared::default());

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let runner = Arc::clone(&runner);
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("trial-worker-{}", i))
                .spawn(move || worker_loop(runner, jobs, done, shared))
                .map_err(BackendError::Spawn)?;
            handles.push(handle);
        }
        info!(workers = count, "started local worker pool");

        Ok(Self {
            jobs: Some(job_tx),
            completions: done_rx,
            shared,
            workers: handles,
            next_task: 0,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(
    runner: Arc<dyn TrialRunner>,
    jobs: Receiver<Job>,
    done: Sender<Completion>,
    shared: Arc<Shared>,
) {
    for job in jobs.iter() {
        if shared.closing.load(Ordering::Acquire) {
            break;
        }
        if shared.take_cancelled(job.task) {
            debug!(task = %job.task, "skipping cancelled trial");
            continue;
        }
        let outcome = runner.run_trial(&job.spec);
        if done
            .send(Completion {
                task: job.task,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit_many(
        &mut self,
        spec: &TrialSpec,
        count: usize,
    ) -> Result<Vec<TaskId>, BackendError> {
        let jobs = self.jobs.as_ref().ok_or(BackendError::Disconnected)?;
        let spec = Arc::new(spec.clone());
        let mut tasks = Vec::with_capacity(count);
        for _ in 0..count {
            let task = TaskId(self.next_task);
            self.next_task += 1;
            jobs.send(Job {
                task,
                spec: Arc::clone(&spec),
            })
            .map_err(|_| BackendError::Disconnected)?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    fn await_any(&mut self, timeout: Duration) -> Result<Vec<Completion>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let first = match self.completions.recv_timeout(remaining) {
                Ok(c) => c,
                Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
                Err(RecvTimeoutError::Disconnected) => return Err(BackendError::Disconnected),
            };
            let ready: Vec<Completion> = std::iter::once(first)
                .chain(self.completions.try_iter())
                .filter(|c| !self.shared.take_cancelled(c.task))
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }
        }
    }

    fn cancel(&mut self, tasks: &[TaskId]) {
        self.shared.mark_cancelled(tasks.iter().copied());
    }

    fn shutdown(&mut self) {
        if self.jobs.take().is_none() {
            return;
        }
        self.shared.closing.store(true, Ordering::Release);
        let mut still_running = 0;
        for handle in self.workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                still_running += 1;
            }
        }
        debug!(still_running, "local worker pool shut down");
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
