//! `Idle → Submitting → AwaitingCompletion → Draining → Done`. The scheduler
//! is the only owner of the slot array, the in-flight set and the result
//! store.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, Completion, TaskId};
use crate::slots::{ClaimOutcome, SlotTracker};
use crate::store::{compute_hash, ContentHash, ResultStore, StoreError};
use crate::trial::{TrialOutcome, TrialResult, TrialSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub total: usize,
    pub batch: usize,
    pub progress_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            total: 1,
            batch: 1,
            progress_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    Idle,
    Submitting,
    AwaitingCompletion,
    Draining,
    Done,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    pub resumed: usize,
    pub submitted: usize,
    pub completed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub duplicates: usize,
    /// Accepted after every slot was already taken.
    pub stale: usize,
    pub persist_failures: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub filled: usize,
    pub target: usize,
    pub resumed: usize,
    pub submitted: usize,
    pub completed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub persist_failures: usize,
    pub cancelled: usize,
    pub elapsed_secs: f64,
    pub hashes: Vec<ContentHash>,
}

pub struct Scheduler<B: Backend> {
    backend: B,
    store: ResultStore,
    spec: TrialSpec,
    options: SchedulerOptions,
    slots: SlotTracker,
    in_flight: BTreeSet<TaskId>,
    state: SearchState,
    stats: SearchStats,
    started: Instant,
    last_progress: Instant,
    progress_reports: u64,
}

impl<B: Backend> Scheduler<B> {
    pub fn new(backend: B, store: ResultStore, spec: TrialSpec, options: SchedulerOptions) -> Self {
        let now = Instant::now();
        Self {
            backend,
            store,
            spec,
            options,
            slots: SlotTracker::new(options.total),
            in_flight: BTreeSet::new(),
            state: SearchState::Idle,
            stats: SearchStats::default(),
            started: now,
            last_progress: now,
            progress_reports: 0,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn slots(&self) -> &SlotTracker {
        &self.slots
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn progress_reports(&self) -> u64 {
        self.progress_reports
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Drives the machine to `Done`. The backend is shut down on every exit
    /// path, including errors.
    pub fn run(&mut self) -> Result<SearchReport, SearchError> {
        loop {
            match self.step() {
                Ok(SearchState::Done) => return Ok(self.report()),
                Ok(_) => {}
                Err(err) => {
                    self.backend.shutdown();
                    return Err(err);
                }
            }
        }
    }

    pub fn step(&mut self) -> Result<SearchState, SearchError> {
        self.state = match self.state {
            SearchState::Idle => self.resume()?,
            SearchState::Submitting => self.submit()?,
            SearchState::AwaitingCompletion => self.await_completions()?,
            SearchState::Draining => self.drain(),
            SearchState::Done => SearchState::Done,
        };
        Ok(self.state)
    }

    pub fn report(&self) -> SearchReport {
        let s = &self.stats;
        SearchReport {
            filled: self.slots.filled_count(),
            target: self.slots.len(),
            resumed: s.resumed,
            submitted: s.submitted,
            completed: s.completed,
            accepted: s.accepted,
            rejected: s.rejected,
            failed: s.failed,
            duplicates: s.duplicates,
            stale: s.stale,
            persist_failures: s.persist_failures,
            cancelled: s.cancelled,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            hashes: self.slots.filled().cloned().collect(),
        }
    }

    fn resume(&mut self) -> Result<SearchState, SearchError> {
        let existing = self.store.scan()?;
        let found = existing.len();
        self.stats.resumed = self.slots.seed(existing);
        if found > 0 {
            info!(
                found,
                seeded = self.stats.resumed,
                target = self.slots.len(),
                "resuming from existing towers"
            );
        }
        Ok(SearchState::Submitting)
    }

    fn submit(&mut self) -> Result<SearchState, SearchError> {
        if self.slots.is_full() {
            info!(filled = self.slots.filled_count(), "all slots already filled");
            self.backend.shutdown();
            return Ok(SearchState::Done);
        }
        let window = self.options.batch.min(self.slots.empty_count());
        let deficit = window.saturating_sub(self.in_flight.len());
        if deficit > 0 {
            let tasks = self.backend.submit_many(&self.spec, deficit)?;
            debug!(requested = deficit, submitted = tasks.len(), "submitted trials");
            self.stats.submitted += tasks.len();
            self.in_flight.extend(tasks);
        }
        Ok(SearchState::AwaitingCompletion)
    }

    fn await_completions(&mut self) -> Result<SearchState, SearchError> {
        if self.in_flight.is_empty() {
            return Ok(SearchState::Submitting);
        }
        let ready = self.backend.await_any(self.options.progress_interval)?;
        if ready.is_empty() || self.last_progress.elapsed() >= self.options.progress_interval {
            self.log_progress();
        }
        for completion in ready {
            self.handle(completion);
        }
        if self.slots.is_full() {
            self.cancel_in_flight();
            return Ok(SearchState::Draining);
        }
        Ok(SearchState::Submitting)
    }

    fn drain(&mut self) -> SearchState {
        self.cancel_in_flight();
        self.backend.shutdown();
        info!(
            filled = self.slots.filled_count(),
            accepted = self.stats.accepted,
            elapsed_secs = self.started.elapsed().as_secs_f64(),
            "search finished"
        );
        SearchState::Done
    }

    fn cancel_in_flight(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let leftovers: Vec<TaskId> = std::mem::take(&mut self.in_flight).into_iter().collect();
        debug!(count = leftovers.len(), "cancelling leftover trials");
        self.stats.cancelled += leftovers.len();
        self.backend.cancel(&leftovers);
    }

    fn handle(&mut self, completion: Completion) {
        let Completion { task, outcome } = completion;
        if !self.in_flight.remove(&task) {
            debug!(task = %task, "ignoring completion of unknown task");
            return;
        }
        self.stats.completed += 1;
        match outcome {
            TrialOutcome::Rejected => self.stats.rejected += 1,
            TrialOutcome::Failed { message } => {
                self.stats.failed += 1;
                warn!(task = %task, error = %message, "trial failed");
            }
            TrialOutcome::Accepted { result } => {
                self.stats.accepted += 1;
                self.accept(task, &result);
            }
        }
    }

    fn accept(&mut self, task: TaskId, result: &TrialResult) {
        let hash = match compute_hash(result) {
            Ok(hash) => hash,
            Err(err) => {
                self.stats.persist_failures += 1;
                warn!(task = %task, error = %err, "failed to hash accepted tower");
                return;
            }
        };
        // Equal content shares one path, so a duplicate is dropped before it
        // can touch the file owned by the filled slot.
        if let Some(slot) = self.slots.position(&hash) {
            self.stats.duplicates += 1;
            debug!(task = %task, %hash, slot, "duplicate tower dropped");
            return;
        }
        let path = match self.store.persist(result, &hash) {
            Ok(path) => path,
            Err(err) => {
                self.stats.persist_failures += 1;
                warn!(task = %task, %hash, error = %err, "failed to save tower");
                return;
            }
        };
        match self.slots.claim(hash.clone()) {
            ClaimOutcome::Claimed(slot) => {
                info!(
                    slot,
                    filled = self.slots.filled_count(),
                    target = self.slots.len(),
                    path = %path.display(),
                    "tower accepted"
                );
            }
            ClaimOutcome::Duplicate(slot) => {
                self.stats.duplicates += 1;
                debug!(task = %task, %hash, slot, "duplicate tower dropped");
            }
            ClaimOutcome::NoCapacity => {
                self.stats.stale += 1;
                debug!(task = %task, %hash, "no free slot; discarding tower");
                if let Err(err) = self.store.discard(&hash) {
                    warn!(%hash, error = %err, "failed to discard tower");
                }
            }
        }
    }

    fn log_progress(&mut self) {
        self.last_progress = Instant::now();
        self.progress_reports += 1;
        info!(
            filled = self.slots.filled_count(),
            target = self.slots.len(),
            in_flight = self.in_flight.len(),
            elapsed_secs = self.started.elapsed().as_secs(),
            "search progress"
        );
    }
}
