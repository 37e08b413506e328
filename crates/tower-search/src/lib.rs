use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub mod backend;
pub mod collaborators;
pub mod config;
pub mod predicate;
pub mod render;
pub mod scheduler;
pub mod slots;
pub mod store;
pub mod trial;

pub use backend::batch::{run_trial_job, BatchQueueBackend, BatchQueueConfig, TrialJob};
pub use backend::local::LocalBackend;
pub use backend::{Backend, BackendError, Completion, TaskId};
pub use collaborators::{CommandEvaluator, CommandGenerator};
pub use config::{BackendConfig, ConfigError, SearchFile, SearchOverrides};
pub use predicate::{Metric, Predicate};
pub use render::{RenderError, RenderMode, RenderOptions, RenderOutcome, RenderRequest};
pub use scheduler::{
    Scheduler, SchedulerOptions, SearchError, SearchReport, SearchState, SearchStats,
};
pub use slots::{ClaimOutcome, Slot, SlotTracker};
pub use store::{canonical_json_bytes, compute_hash, ContentHash, ResultStore, StoreError};
pub use trial::{
    BaseSpec, Evaluation, Evaluator, Generator, Stats, TrialOutcome, TrialPipeline, TrialResult,
    TrialRunner, TrialSpec,
};

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Writes `bytes` next to `path` under a hidden temporary name and renames it
/// into place, so readers never observe a partial file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct SearchRun {
    pub out_dir: PathBuf,
    pub backend: &'static str,
    pub report: SearchReport,
}

pub fn run_search(file: &SearchFile) -> Result<SearchRun> {
    file.validate()?;
    let out_dir = file.resolve_output_dir(Local::now());
    info!(out_dir = %out_dir.display(), "saving new towers");
    if file.search.debug {
        info!("running in debug mode; towers will not be rejected");
    }

    let store = ResultStore::open(&out_dir)
        .with_context(|| format!("failed to open output directory {}", out_dir.display()))?;
    let spec = file.trial_spec()?;
    let predicate = file.predicate();
    let options = SchedulerOptions::from(&file.search);

    let run = |backend: Box<dyn Backend>| -> Result<SearchRun> {
        let name = backend.name();
        let mut scheduler = Scheduler::new(backend, store, spec, options);
        let report = scheduler.run()?;
        Ok(SearchRun {
            out_dir: out_dir.clone(),
            backend: name,
            report,
        })
    };

    match &file.backend {
        BackendConfig::Local { workers } => {
            let pipeline = TrialPipeline::new(
                Box::new(CommandGenerator::new(
                    file.collaborators.generator.clone(),
                    file.collaborators.workdir.clone(),
                )),
                Box::new(CommandEvaluator::new(
                    file.collaborators.evaluator.clone(),
                    file.collaborators.workdir.clone(),
                )),
                predicate,
                file.search.debug,
            );
            let backend = LocalBackend::new(Arc::new(pipeline), *workers)?;
            run(Box::new(backend))
        }
        BackendConfig::BatchQueue(queue) => {
            let backend = BatchQueueBackend::new(
                queue.clone(),
                out_dir.join(".queue"),
                file.collaborators.clone(),
                predicate,
                file.search.debug,
            )?;
            run(Box::new(backend))
        }
    }
}
