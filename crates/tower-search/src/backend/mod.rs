//! Execution substrates for trials.
//!
//! The scheduler only sees the [`Backend`] capability set. Work goes in
//! through `submit_many`, results come back one batch at a time through
//! `await_any`, and `cancel` is a best-effort request that may lose the race
//! with a task already running. Completions for tasks that were cancelled are
//! read and dropped by the backend or ignored by the scheduler; they are never
//! routed into slots.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::trial::{TrialOutcome, TrialSpec};

pub mod batch;
pub mod local;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub task: TaskId,
    pub outcome: TrialOutcome,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("submission rejected: {0}")]
    Submission(String),
    #[error("worker pool disconnected")]
    Disconnected,
    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn submit_many(&mut self, spec: &TrialSpec, count: usize)
        -> Result<Vec<TaskId>, BackendError>;

    /// Blocks until at least one task finishes or `timeout` passes; returns
    /// every completion that is ready (possibly none on timeout).
    fn await_any(&mut self, timeout: Duration) -> Result<Vec<Completion>, BackendError>;

    fn cancel(&mut self, tasks: &[TaskId]);

    /// Cancels anything outstanding and releases resources. Idempotent.
    fn shutdown(&mut self);
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn submit_many(
        &mut self,
        spec: &TrialSpec,
        count: usize,
    ) -> Result<Vec<TaskId>, BackendError> {
        (**self).submit_many(spec, count)
    }

    fn await_any(&mut self, timeout: Duration) -> Result<Vec<Completion>, BackendError> {
        (**self).await_any(timeout)
    }

    fn cancel(&mut self, tasks: &[TaskId]) {
        (**self).cancel(tasks)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}
