use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backend::batch::BatchQueueConfig;
use crate::predicate::{Metric, Predicate};
use crate::scheduler::SchedulerOptions;
use crate::trial::{BaseSpec, TrialSpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse base structure {path}: {source}")]
    Base {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid search configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFile {
    pub search: SearchSection,
    pub trial: TrialSection,
    pub collaborators: CollaboratorConfig,
    pub paths: PathsConfig,
    pub backend: BackendConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub total: usize,
    pub batch: usize,
    pub metric: Metric,
    pub threshold: f64,
    pub debug: bool,
    pub out: Option<String>,
    pub progress_interval_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            total: 1,
            batch: 1,
            metric: Metric::Stable,
            threshold: 0.0,
            debug: false,
            out: None,
            progress_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialSection {
    pub base: [u32; 2],
    /// Pre-built tower to extend; replaces `base` when set.
    pub base_path: Option<PathBuf>,
    pub size: u32,
    pub shape: [u32; 3],
    pub materials: BTreeMap<String, f64>,
    pub noise: f64,
    pub force: f64,
    pub frames: u32,
}

impl Default for TrialSection {
    fn default() -> Self {
        let spec = TrialSpec::default();
        Self {
            base: [2, 2],
            base_path: None,
            size: spec.size,
            shape: spec.shape,
            materials: spec.materials,
            noise: spec.noise,
            force: spec.force,
            frames: spec.frames,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub generator: Vec<String>,
    pub evaluator: Vec<String>,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub towers: PathBuf,
    pub renders: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            towers: PathBuf::from("towers"),
            renders: PathBuf::from("renders"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        #[serde(default)]
        workers: Option<usize>,
    },
    BatchQueue(BatchQueueConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local { workers: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Renderer argv; render arguments are appended after `--`.
    pub command: Vec<String>,
    pub materials: PathBuf,
    pub resolution: [u32; 2],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            command: ["/blender/blender", "-noaudio", "--background", "-P", "render.py"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            materials: PathBuf::from("materials.blend"),
            resolution: [512, 512],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOverrides {
    pub total: Option<usize>,
    pub batch: Option<usize>,
    pub size: Option<u32>,
    pub base: Option<[u32; 2]>,
    pub base_path: Option<PathBuf>,
    pub shape: Option<[u32; 3]>,
    pub noise: Option<f64>,
    pub force: Option<f64>,
    pub metric: Option<Metric>,
    pub threshold: Option<f64>,
    pub out: Option<String>,
    pub slurm: bool,
    pub debug: bool,
}

impl SearchFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: SearchOverrides) {
        let SearchOverrides {
            total,
            batch,
            size,
            base,
            base_path,
            shape,
            noise,
            force,
            metric,
            threshold,
            out,
            slurm,
            debug,
        } = overrides;
        if let Some(v) = total {
            self.search.total = v;
        }
        if let Some(v) = batch {
            self.search.batch = v;
        }
        if let Some(v) = size {
            self.trial.size = v;
        }
        if let Some(v) = base {
            self.trial.base = v;
        }
        if base_path.is_some() {
            self.trial.base_path = base_path;
        }
        if let Some(v) = shape {
            self.trial.shape = v;
        }
        if let Some(v) = noise {
            self.trial.noise = v;
        }
        if let Some(v) = force {
            self.trial.force = v;
        }
        if let Some(v) = metric {
            self.search.metric = v;
        }
        if let Some(v) = threshold {
            self.search.threshold = v;
        }
        if out.is_some() {
            self.search.out = out;
        }
        if slurm && !matches!(self.backend, BackendConfig::BatchQueue(_)) {
            self.backend = BackendConfig::BatchQueue(BatchQueueConfig::default());
        }
        self.search.debug |= debug;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.search.total == 0 {
            problems.push("search.total must be at least 1".to_string());
        }
        if self.search.batch == 0 {
            problems.push("search.batch must be at least 1".to_string());
        }
        if !self.search.threshold.is_finite() {
            problems.push("search.threshold must be a finite number".to_string());
        }
        if self.search.progress_interval_secs == 0 {
            problems.push("search.progress_interval_secs must be at least 1".to_string());
        }
        if self.collaborators.generator.is_empty() {
            problems.push("collaborators.generator command is required".to_string());
        }
        if self.collaborators.evaluator.is_empty() {
            problems.push("collaborators.evaluator command is required".to_string());
        }
        if self.trial.shape.contains(&0) {
            problems.push("trial.shape dimensions must be positive".to_string());
        }
        if self.trial.materials.is_empty() {
            problems.push("trial.materials must name at least one material".to_string());
        }
        if self.trial.materials.values().any(|w| !w.is_finite() || *w < 0.0) {
            problems.push("trial.materials weights must be non-negative".to_string());
        }
        if let BackendConfig::Local { workers: Some(0) } = self.backend {
            problems.push("backend.workers must be at least 1".to_string());
        }
        if let BackendConfig::BatchQueue(queue) = &self.backend {
            if queue.max_array == 0 {
                problems.push("backend.max_array must be at least 1".to_string());
            }
            if queue.poll_interval_ms == 0 {
                problems.push("backend.poll_interval_ms must be at least 1".to_string());
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// `<towers>/<out>` or `<towers>/simple_<metric>_<yymmdd_HHMMSS>`, with
    /// `_extended` appended when building on a pre-built base.
    pub fn resolve_output_dir(&self, now: DateTime<Local>) -> PathBuf {
        let mut name = match &self.search.out {
            Some(out) => out.clone(),
            None => format!(
                "simple_{}_{}",
                self.search.metric,
                now.format("%y%m%d_%H%M%S")
            ),
        };
        if self.trial.base_path.is_some() {
            name.push_str("_extended");
        }
        self.paths.towers.join(name)
    }

    pub fn trial_spec(&self) -> Result<TrialSpec, ConfigError> {
        let base = match &self.trial.base_path {
            Some(path) => BaseSpec::Prebuilt(load_base(path)?),
            None => BaseSpec::Footprint(self.trial.base),
        };
        Ok(TrialSpec {
            base,
            size: self.trial.size,
            shape: self.trial.shape,
            materials: self.trial.materials.clone(),
            noise: self.trial.noise,
            force: self.trial.force,
            frames: self.trial.frames,
        })
    }

    pub fn predicate(&self) -> Predicate {
        Predicate::new(self.search.metric, self.search.threshold)
    }
}

impl From<&SearchSection> for SchedulerOptions {
    fn from(search: &SearchSection) -> Self {
        SchedulerOptions {
            total: search.total,
            batch: search.batch,
            progress_interval: Duration::from_secs(search.progress_interval_secs),
        }
    }
}

/// Reads a tower to build on. A persisted search result contributes its
/// `struct` field; anything else is taken as the structure itself.
pub fn load_base(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_slice(&raw).map_err(|source| ConfigError::Base {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match value {
        Value::Object(mut map) if map.contains_key("struct") => {
            map.remove("struct").unwrap_or(Value::Null)
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn runnable() -> SearchFile {
        let mut file = SearchFile::default();
        file.collaborators.generator = vec!["gen".to_string()];
        file.collaborators.evaluator = vec!["sim".to_string()];
        file
    }

    #[test]
    fn defaults_match_search_defaults() {
        let file = SearchFile::default();
        assert_eq!(file.search.total, 1);
        assert_eq!(file.search.batch, 1);
        assert_eq!(file.search.metric, Metric::Stable);
        assert_eq!(file.search.threshold, 0.0);
        assert_eq!(file.trial.base, [2, 2]);
        assert_eq!(file.trial.shape, [3, 1, 1]);
        assert_eq!(file.trial.noise, 0.15);
        assert_eq!(file.trial.force, 900.0);
        assert!(matches!(file.backend, BackendConfig::Local { workers: None }));
    }

    #[test]
    fn validate_reports_all_problems() {
        let mut file = SearchFile::default();
        file.search.batch = 0;
        file.search.total = 0;
        file.trial.shape = [3, 0, 1];
        let err = file.validate().expect_err("should fail");
        let msg = err.to_string();
        for needle in [
            "search.total",
            "search.batch",
            "collaborators.generator",
            "collaborators.evaluator",
            "trial.shape",
        ] {
            assert!(msg.contains(needle), "missing {}: {}", needle, msg);
        }
        assert!(!msg.contains("search.threshold"), "{}", msg);
    }

    #[test]
    fn validate_passes_on_complete_file() {
        runnable().validate().expect("valid");
    }

    #[test]
    fn yaml_file_parses_with_partial_sections() {
        let yaml = r#"
search:
  total: 12
  batch: 4
  metric: unstable
  threshold: 0.5
trial:
  size: 6
  materials: { Wood: 1.0, Metal: 0.5 }
collaborators:
  generator: ["python3", "gen.py"]
  evaluator: ["python3", "sim.py"]
backend:
  kind: batch_queue
  qos: use-everything
  max_array: 50
"#;
        let file: SearchFile = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(file.search.total, 12);
        assert_eq!(file.search.metric, Metric::Unstable);
        assert_eq!(file.trial.size, 6);
        assert_eq!(file.trial.frames, 240);
        assert_eq!(file.trial.materials.len(), 2);
        match &file.backend {
            BackendConfig::BatchQueue(queue) => {
                assert_eq!(queue.qos.as_deref(), Some("use-everything"));
                assert_eq!(queue.max_array, 50);
                assert_eq!(queue.submit_command, "sbatch");
            }
            other => panic!("expected batch queue, got {:?}", other),
        }
        file.validate().expect("valid");
    }

    #[test]
    fn overrides_take_precedence() {
        let mut file = runnable();
        file.apply(SearchOverrides {
            total: Some(5),
            batch: Some(8),
            metric: Some(Metric::Unstable),
            threshold: Some(0.7),
            out: Some("run_a".to_string()),
            slurm: true,
            debug: true,
            ..Default::default()
        });
        assert_eq!(file.search.total, 5);
        assert_eq!(file.search.batch, 8);
        assert_eq!(file.predicate(), Predicate::new(Metric::Unstable, 0.7));
        assert!(file.search.debug);
        assert!(matches!(file.backend, BackendConfig::BatchQueue(_)));
        assert_eq!(file.search.out.as_deref(), Some("run_a"));
    }

    #[test]
    fn output_dir_defaults_to_metric_and_timestamp() {
        let mut file = runnable();
        file.paths.towers = PathBuf::from("/data/towers");
        let now = Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("timestamp")
            .with_timezone(&Local);
        let expected = format!("simple_stable_{}", now.format("%y%m%d_%H%M%S"));
        assert_eq!(
            file.resolve_output_dir(now),
            PathBuf::from("/data/towers").join(expected)
        );

        file.search.out = Some("named".to_string());
        file.trial.base_path = Some(PathBuf::from("base.json"));
        assert_eq!(
            file.resolve_output_dir(now),
            PathBuf::from("/data/towers/named_extended")
        );
    }

    #[test]
    fn base_path_unwraps_persisted_results() {
        let dir = std::env::temp_dir().join(format!(
            "tower_config_base_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let artifact = dir.join("artifact.json");
        fs::write(
            &artifact,
            serde_json::to_vec(&json!({"struct": {"blocks": [1]}, "stats": {}, "trace": {}}))
                .expect("json"),
        )
        .expect("write");
        let plain = dir.join("plain.json");
        fs::write(&plain, b"{\"blocks\": [2]}").expect("write");

        assert_eq!(load_base(&artifact).expect("artifact"), json!({"blocks": [1]}));
        assert_eq!(load_base(&plain).expect("plain"), json!({"blocks": [2]}));

        let mut file = runnable();
        file.trial.base_path = Some(plain);
        assert_eq!(
            file.trial_spec().expect("spec").base,
            BaseSpec::Prebuilt(json!({"blocks": [2]}))
        );
        let _ = fs::remove_dir_all(dir);
    }
}
