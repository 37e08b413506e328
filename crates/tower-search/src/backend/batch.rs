//! SLURM array-job backend. Each `submit_many` becomes one array job whose
//! tasks run `tower trial --job <job.json> --out <inbox>/task_<id>.json`.
//! Every backend instance stages into its own run directory, because a task
//! cancelled by an earlier run may still write its outcome later.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Backend, BackendError, Completion, TaskId};
use crate::collaborators::{CommandEvaluator, CommandGenerator};
use crate::config::CollaboratorConfig;
use crate::predicate::Predicate;
use crate::trial::{TrialOutcome, TrialPipeline, TrialRunner, TrialSpec};
use crate::{atomic_write_bytes, ensure_dir};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchQueueConfig {
    pub submit_command: String,
    pub cancel_command: String,
    /// Maximum array tasks the queue may run at once (`--array ...%N`).
    pub max_array: usize,
    pub job_name: String,
    pub qos: Option<String>,
    pub partition: Option<String>,
    pub cpus_per_task: u32,
    pub memory: String,
    pub walltime: String,
    pub requeue: bool,
    pub output: String,
    pub workdir: Option<PathBuf>,
    pub directives: Vec<String>,
    pub setup: Vec<String>,
    pub worker_command: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            cancel_command: "scancel".to_string(),
            max_array: 100,
            job_name: "tower-search".to_string(),
            qos: None,
            partition: None,
            cpus_per_task: 1,
            memory: "512MB".to_string(),
            walltime: "180".to_string(),
            requeue: true,
            output: "/dev/null".to_string(),
            workdir: None,
            directives: Vec::new(),
            setup: Vec::new(),
            worker_command: Vec::new(),
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialJob {
    pub spec: TrialSpec,
    pub collaborators: CollaboratorConfig,
    pub predicate: Predicate,
    pub debug: bool,
}

impl TrialJob {
    pub fn pipeline(&self) -> TrialPipeline {
        TrialPipeline::new(
            Box::new(CommandGenerator::new(
                self.collaborators.generator.clone(),
                self.collaborators.workdir.clone(),
            )),
            Box::new(CommandEvaluator::new(
                self.collaborators.evaluator.clone(),
                self.collaborators.workdir.clone(),
            )),
            self.predicate,
            self.debug,
        )
    }
}

/// An unreadable job still produces a `failed` outcome file so the scheduler
/// waiting on this task is not left hanging.
pub fn run_trial_job(job_path: &Path, out_path: &Path) -> Result<TrialOutcome> {
    let outcome = match load_job(job_path) {
        Ok(job) => job.pipeline().run_trial(&job.spec),
        Err(err) => TrialOutcome::Failed {
            message: format!("{:#}", err),
        },
    };
    let bytes = serde_json::to_vec_pretty(&outcome)?;
    atomic_write_bytes(out_path, &bytes)
        .with_context(|| format!("failed to write outcome {}", out_path.display()))?;
    Ok(outcome)
}

fn load_job(path: &Path) -> Result<TrialJob> {
    let raw = fs::read(path).with_context(|| format!("failed to read job {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse job {}", path.display()))
}

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct ArrayTask {
    job_id: String,
    index: usize,
}

pub struct BatchQueueBackend {
    config: BatchQueueConfig,
    run_dir: PathBuf,
    inbox: PathBuf,
    collaborators: CollaboratorConfig,
    predicate: Predicate,
    debug: bool,
    outstanding: BTreeMap<TaskId, ArrayTask>,
    cancelled: HashSet<TaskId>,
    next_task: u64,
    submissions: u64,
    closed: bool,
}

impl BatchQueueBackend {
    pub fn new(
        config: BatchQueueConfig,
        staging: PathBuf,
        collaborators: CollaboratorConfig,
        predicate: Predicate,
        debug: bool,
    ) -> Result<Self, BackendError> {
        let run_dir = staging.join(format!(
            "run_{}_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            RUN_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let inbox = run_dir.join("inbox");
        ensure_dir(&inbox).map_err(|source| BackendError::Io {
            path: inbox.clone(),
            source,
        })?;
        Ok(Self {
            config,
            run_dir,
            inbox,
            collaborators,
            predicate,
            debug,
            outstanding: BTreeMap::new(),
            cancelled: HashSet::new(),
            next_task: 0,
            submissions: 0,
            closed: false,
        })
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn job_path(&self) -> PathBuf {
        self.run_dir.join("job.json")
    }

    fn outcome_path(&self, task: TaskId) -> PathBuf {
        self.inbox.join(format!("task_{}.json", task.0))
    }

    fn worker_command(&self) -> Result<Vec<String>, BackendError> {
        if !self.config.worker_command.is_empty() {
            return Ok(self.config.worker_command.clone());
        }
        let exe = std::env::current_exe().map_err(|source| BackendError::Io {
            path: PathBuf::from("<current executable>"),
            source,
        })?;
        Ok(vec![exe.to_string_lossy().to_string(), "trial".to_string()])
    }

    fn write_job(&self, spec: &TrialSpec) -> Result<PathBuf, BackendError> {
        let job = TrialJob {
            spec: spec.clone(),
            collaborators: self.collaborators.clone(),
            predicate: self.predicate,
            debug: self.debug,
        };
        let path = self.job_path();
        let bytes = serde_json::to_vec_pretty(&job)?;
        atomic_write_bytes(&path, &bytes).map_err(|source| BackendError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn submit_script(&self, script: &Path) -> Result<String, BackendError> {
        let output = Command::new(&self.config.submit_command)
            .arg("--parsable")
            .arg(script)
            .output()
            .map_err(|e| {
                BackendError::Submission(format!(
                    "failed to run `{}`: {}",
                    self.config.submit_command, e
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output");
            return Err(BackendError::Submission(format!(
                "`{}` exited with {}: {}",
                self.config.submit_command, output.status, tail
            )));
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            BackendError::Submission(format!(
                "`{}` did not print a job id",
                self.config.submit_command
            ))
        })
    }

    fn collect_ready(&mut self) -> Result<Vec<Completion>, BackendError> {
        let entries = fs::read_dir(&self.inbox).map_err(|source| BackendError::Io {
            path: self.inbox.clone(),
            source,
        })?;
        let mut ready = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(task) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_outcome_name)
            else {
                continue;
            };
            let outcome = match fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_slice::<TrialOutcome>(&raw)?))
            {
                Ok(outcome) => outcome,
                Err(err) => TrialOutcome::Failed {
                    message: format!("unreadable outcome {}: {}", path.display(), err),
                },
            };
            let _ = fs::remove_file(&path);
            if self.cancelled.remove(&task) || self.outstanding.remove(&task).is_none() {
                debug!(task = %task, "discarding outcome of cancelled task");
                continue;
            }
            ready.push(Completion { task, outcome });
        }
        ready.sort_by_key(|c| c.task);
        Ok(ready)
    }
}

impl Backend for BatchQueueBackend {
    fn name(&self) -> &'static str {
        "batch_queue"
    }

    fn submit_many(
        &mut self,
        spec: &TrialSpec,
        count: usize,
    ) -> Result<Vec<TaskId>, BackendError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.closed {
            return Err(BackendError::Disconnected);
        }
        let job_path = self.write_job(spec)?;
        let first = self.next_task;
        let script = render_script(
            &self.config,
            &self.worker_command()?,
            &job_path,
            &self.inbox,
            first,
            count,
        );
        self.submissions += 1;
        let script_path = self
            .run_dir
            .join(format!("submit_{}.sh", self.submissions));
        atomic_write_bytes(&script_path, script.as_bytes()).map_err(|source| {
            BackendError::Io {
                path: script_path.clone(),
                source,
            }
        })?;

        let job_id = self.submit_script(&script_path)?;
        info!(job_id = %job_id, tasks = count, "submitted array job");

        let mut tasks = Vec::with_capacity(count);
        for index in 0..count {
            let task = TaskId(first + index as u64);
            self.outstanding.insert(
                task,
                ArrayTask {
                    job_id: job_id.clone(),
                    index,
                },
            );
            tasks.push(task);
        }
        self.next_task += count as u64;
        Ok(tasks)
    }

    fn await_any(&mut self, timeout: Duration) -> Result<Vec<Completion>, BackendError> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let ready = self.collect_ready()?;
            if !ready.is_empty() {
                return Ok(ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    fn cancel(&mut self, tasks: &[TaskId]) {
        let mut targets = Vec::new();
        for task in tasks {
            if let Some(array_task) = self.outstanding.remove(task) {
                self.cancelled.insert(*task);
                targets.push(format!("{}_{}", array_task.job_id, array_task.index));
            }
        }
        if targets.is_empty() {
            return;
        }
        match Command::new(&self.config.cancel_command)
            .args(&targets)
            .status()
        {
            Ok(status) if status.success() => {
                info!(tasks = targets.len(), "cancelled array tasks")
            }
            Ok(status) => warn!(%status, "`{}` failed", self.config.cancel_command),
            Err(err) => warn!(error = %err, "failed to run `{}`", self.config.cancel_command),
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        let leftovers: Vec<TaskId> = self.outstanding.keys().copied().collect();
        self.cancel(&leftovers);
        // Late outcomes are never read after this point.
        self.cancelled.clear();
        self.closed = true;
    }
}

impl Drop for BatchQueueBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `sbatch --parsable` prints `<job_id>` or `<job_id>;<cluster>`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

fn parse_outcome_name(name: &str) -> Option<TaskId> {
    name.strip_prefix("task_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
        .map(TaskId)
}

fn render_script(
    config: &BatchQueueConfig,
    worker: &[String],
    job_path: &Path,
    inbox: &Path,
    first_task: u64,
    count: usize,
) -> String {
    let throttle = config.max_array.min(count).max(1);
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH --job-name={}", config.job_name),
        format!("#SBATCH --array=0-{}%{}", count - 1, throttle),
        format!("#SBATCH --cpus-per-task={}", config.cpus_per_task),
        format!("#SBATCH --mem={}", config.memory),
        format!("#SBATCH --time={}", config.walltime),
        format!("#SBATCH --output={}", config.output),
    ];
    if let Some(qos) = &config.qos {
        lines.push(format!("#SBATCH --qos={}", qos));
    }
    if let Some(partition) = &config.partition {
        lines.push(format!("#SBATCH --partition={}", partition));
    }
    if config.requeue {
        lines.push("#SBATCH --requeue".to_string());
    }
    if let Some(dir) = &config.workdir {
        lines.push(format!("#SBATCH --chdir={}", dir.display()));
    }
    for directive in &config.directives {
        lines.push(format!("#SBATCH {}", directive));
    }
    lines.push(String::new());
    lines.extend(config.setup.iter().cloned());
    lines.push(format!(
        "TASK=$(( {} + SLURM_ARRAY_TASK_ID ))",
        first_task
    ));
    lines.push(format!(
        "exec {} --job {} --out {}/task_${{TASK}}.json",
        shell_join(worker),
        shell_quote(&job_path.to_string_lossy()),
        shell_quote(&inbox.to_string_lossy())
    ));
    lines.push(String::new());
    lines.join("\n")
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Metric;
    use chrono::Utc;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tower_batch_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn backend(root: &Path, config: BatchQueueConfig) -> BatchQueueBackend {
        BatchQueueBackend::new(
            config,
            root.join(".queue"),
            CollaboratorConfig::default(),
            Predicate::new(Metric::Stable, 0.5),
            false,
        )
        .expect("backend")
    }

    #[test]
    fn parse_job_id_handles_cluster_suffix() {
        assert_eq!(parse_job_id("4242\n").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("4242;gpu-cluster\n").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("Submitted batch job 4242"), None);
        assert_eq!(parse_job_id(""), None);
    }

    #[test]
    fn outcome_names_map_to_tasks() {
        assert_eq!(parse_outcome_name("task_17.json"), Some(TaskId(17)));
        assert_eq!(parse_outcome_name(".task_17.json.tmp.1.2"), None);
        assert_eq!(parse_outcome_name("task_x.json"), None);
    }

    #[test]
    fn script_carries_array_throttle_and_job_parameters() {
        let config = BatchQueueConfig {
            qos: Some("use-everything".to_string()),
            max_array: 3,
            setup: vec!["source /etc/profile.d/modules.sh".to_string()],
            workdir: Some(PathBuf::from("/srv/towers")),
            ..Default::default()
        };
        let script = render_script(
            &config,
            &["/opt/tower".to_string(), "trial".to_string()],
            Path::new("/tmp/run/.queue/job.json"),
            Path::new("/tmp/my run/inbox"),
            10,
            5,
        );
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --array=0-4%3"));
        assert!(script.contains("#SBATCH --qos=use-everything"));
        assert!(script.contains("#SBATCH --requeue"));
        assert!(script.contains("#SBATCH --chdir=/srv/towers"));
        assert!(script.contains("#SBATCH --output=/dev/null"));
        assert!(script.contains("source /etc/profile.d/modules.sh"));
        assert!(script.contains("TASK=$(( 10 + SLURM_ARRAY_TASK_ID ))"));
        assert!(script.contains(
            "exec /opt/tower trial --job /tmp/run/.queue/job.json --out '/tmp/my run/inbox'/task_${TASK}.json"
        ));
        assert!(!script.contains("--partition"));
        assert!(!script.contains("SLURM_ARRAY_JOB_ID"));
    }

    #[test]
    fn shell_quote_wraps_unsafe_strings() {
        assert_eq!(shell_quote("plain/path.json"), "plain/path.json");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn submission_failure_is_reported() {
        let root = temp_dir("reject");
        let mut backend = backend(
            &root,
            BatchQueueConfig {
                submit_command: "false".to_string(),
                worker_command: vec!["tower".to_string(), "trial".to_string()],
                ..Default::default()
            },
        );
        let err = backend
            .submit_many(&TrialSpec::default(), 2)
            .expect_err("submission must fail");
        assert!(matches!(err, BackendError::Submission(_)), "{}", err);
        assert_eq!(backend.outstanding(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    fn executable(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, body).expect("write script");
        let mut perms = fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    #[cfg(unix)]
    #[test]
    fn submit_poll_and_cancel_round_trip() {
        let root = temp_dir("roundtrip");
        ensure_dir(&root).expect("root");
        let sbatch = root.join("fake-sbatch");
        executable(&sbatch, "#!/bin/sh\necho '4242;cluster'\n");
        let cancel_log = root.join("cancelled.txt");
        let scancel = root.join("fake-scancel");
        executable(
            &scancel,
            &format!("#!/bin/sh\necho \"$@\" >> '{}'\n", cancel_log.display()),
        );

        let mut backend = backend(
            &root,
            BatchQueueConfig {
                submit_command: sbatch.to_string_lossy().to_string(),
                cancel_command: scancel.to_string_lossy().to_string(),
                worker_command: vec!["tower".to_string(), "trial".to_string()],
                poll_interval_ms: 10,
                ..Default::default()
            },
        );
        let tasks = backend
            .submit_many(&TrialSpec::default(), 3)
            .expect("submit");
        assert_eq!(tasks, vec![TaskId(0), TaskId(1), TaskId(2)]);
        assert!(backend.run_dir().starts_with(root.join(".queue")));
        assert!(backend.run_dir().join("job.json").is_file());
        assert!(backend.run_dir().join("submit_1.sh").is_file());

        assert!(backend
            .await_any(Duration::from_millis(30))
            .expect("poll")
            .is_empty());

        // Simulate task 1 finishing on the cluster.
        let outcome = serde_json::to_vec(&TrialOutcome::Rejected).expect("json");
        atomic_write_bytes(&backend.outcome_path(TaskId(1)), &outcome).expect("outcome");
        let ready = backend
            .await_any(Duration::from_secs(2))
            .expect("poll");
        assert_eq!(
            ready,
            vec![Completion {
                task: TaskId(1),
                outcome: TrialOutcome::Rejected
            }]
        );
        assert_eq!(backend.outstanding(), 2);

        backend.cancel(&[TaskId(0)]);
        assert_eq!(backend.outstanding(), 1);
        // A cancelled task that still finishes is read and dropped.
        atomic_write_bytes(&backend.outcome_path(TaskId(0)), &outcome).expect("outcome");
        assert!(backend
            .await_any(Duration::from_millis(30))
            .expect("poll")
            .is_empty());
        assert!(!backend.outcome_path(TaskId(0)).exists());

        backend.cancel(&[TaskId(2)]);
        backend.shutdown();
        assert_eq!(backend.outstanding(), 0);
        assert!(backend.cancelled.is_empty());
        let log = fs::read_to_string(&cancel_log).expect("cancel log");
        assert_eq!(log.lines().collect::<Vec<_>>(), vec!["4242_0", "4242_2"]);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn late_outcomes_from_an_earlier_run_are_not_picked_up() {
        let root = temp_dir("late");
        ensure_dir(&root).expect("root");
        let sbatch = root.join("fake-sbatch");
        executable(&sbatch, "#!/bin/sh\necho 77\n");
        let config = BatchQueueConfig {
            submit_command: sbatch.to_string_lossy().to_string(),
            cancel_command: "true".to_string(),
            worker_command: vec!["tower".to_string(), "trial".to_string()],
            poll_interval_ms: 5,
            ..Default::default()
        };

        let mut earlier = backend(&root, config.clone());
        earlier
            .submit_many(&TrialSpec::default(), 1)
            .expect("submit");
        let earlier_outcome = earlier.outcome_path(TaskId(0));
        drop(earlier);

        // The cancelled task finishes after its run is gone.
        let stale = serde_json::to_vec(&TrialOutcome::Failed {
            message: "from an earlier run".to_string(),
        })
        .expect("json");
        atomic_write_bytes(&earlier_outcome, &stale).expect("late outcome");
        atomic_write_bytes(&root.join(".queue/inbox/task_0.json"), &stale).expect("stray");

        let mut current = backend(&root, config);
        let tasks = current
            .submit_many(&TrialSpec::default(), 1)
            .expect("submit");
        assert_eq!(tasks, vec![TaskId(0)]);
        assert_ne!(current.outcome_path(TaskId(0)), earlier_outcome);
        assert!(current
            .await_any(Duration::from_millis(50))
            .expect("poll")
            .is_empty());
        assert_eq!(current.outstanding(), 1);
        current.shutdown();
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn worker_entrypoint_writes_outcome_file() {
        let root = temp_dir("worker");
        ensure_dir(&root).expect("root");
        let job = TrialJob {
            spec: TrialSpec::default(),
            collaborators: CollaboratorConfig {
                generator: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "cat >/dev/null; echo '{\"blocks\": [7]}'".to_string(),
                ],
                evaluator: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    r#"cat >/dev/null; echo '{"trace": {}, "stats": {"instability": 0, "instability_mu": 0.1}}'"#.to_string(),
                ],
                workdir: None,
            },
            predicate: Predicate::new(Metric::Stable, 0.5),
            debug: false,
        };
        let job_path = root.join("job.json");
        fs::write(&job_path, serde_json::to_vec(&job).expect("json")).expect("job");
        let out = root.join("inbox").join("task_0.json");

        let outcome = run_trial_job(&job_path, &out).expect("trial");
        assert!(outcome.is_accepted());
        let written: TrialOutcome =
            serde_json::from_slice(&fs::read(&out).expect("read")).expect("parse");
        assert_eq!(written, outcome);

        let missing = run_trial_job(&root.join("nope.json"), &out).expect("trial");
        assert!(matches!(missing, TrialOutcome::Failed { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
