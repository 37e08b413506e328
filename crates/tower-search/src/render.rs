use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{PathsConfig, RenderConfig};
use crate::store::canonical_json_bytes;
use crate::{atomic_write_bytes, ensure_dir};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    None,
    Motion,
    Frozen,
    Default,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::None => "none",
            RenderMode::Motion => "motion",
            RenderMode::Frozen => "frozen",
            RenderMode::Default => "default",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RenderMode::None),
            "motion" => Ok(RenderMode::Motion),
            "frozen" => Ok(RenderMode::Frozen),
            "default" => Ok(RenderMode::Default),
            other => Err(format!(
                "unknown render mode `{}` (expected none, motion, frozen or default)",
                other
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse tower {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("tower {path} has no `{field}` field")]
    MissingField { path: PathBuf, field: &'static str },
    #[error("failed to encode trace: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("render command is empty")]
    EmptyCommand,
    #[error("failed to start renderer `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("renderer exited with {}", describe_exit(.code))]
    Failed { code: Option<i32> },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

impl RenderError {
    fn io(path: &Path, source: io::Error) -> Self {
        RenderError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub scene: Value,
    pub traces: Vec<Value>,
    pub out: PathBuf,
    pub mode: RenderMode,
    /// Camera angle in radians.
    pub theta: f64,
    pub blocks: Option<Vec<u32>>,
    pub resolution: [u32; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderOutcome {
    pub tower: String,
    pub out_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenderOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub mode: RenderMode,
    pub theta: f64,
    pub resolution: Option<[u32; 2]>,
    pub blocks: Option<Vec<u32>>,
}

fn render_args(
    config: &RenderConfig,
    request: &RenderRequest,
    trace_path: &Path,
) -> Result<Vec<String>, RenderError> {
    let mut args = vec![
        "--".to_string(),
        "--materials".to_string(),
        config.materials.to_string_lossy().to_string(),
        "--out".to_string(),
        request.out.to_string_lossy().to_string(),
        "--save_world".to_string(),
        "--scene".to_string(),
        serde_json::to_string(&request.scene)?,
        "--trace".to_string(),
        trace_path.to_string_lossy().to_string(),
        "--resolution".to_string(),
        request.resolution[0].to_string(),
        request.resolution[1].to_string(),
        "--render_mode".to_string(),
        request.mode.to_string(),
        "--theta".to_string(),
        format!("{:.6}", request.theta),
    ];
    if let Some(blocks) = &request.blocks {
        args.push("--blocks".to_string());
        args.extend(blocks.iter().map(|b| b.to_string()));
    }
    Ok(args)
}

/// Renders one scene. A non-zero exit is reported and never retried.
pub fn render(config: &RenderConfig, request: &RenderRequest) -> Result<(), RenderError> {
    let (program, base_args) = config
        .command
        .split_first()
        .ok_or(RenderError::EmptyCommand)?;
    ensure_dir(&request.out).map_err(|e| RenderError::io(&request.out, e))?;
    let trace_path = request.out.join("trace.json");
    let trace = canonical_json_bytes(&request.traces)?;
    atomic_write_bytes(&trace_path, &trace).map_err(|e| RenderError::io(&trace_path, e))?;

    let args = render_args(config, request, &trace_path)?;
    let status = Command::new(program)
        .args(base_args)
        .args(&args)
        .status()
        .map_err(|source| RenderError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !status.success() {
        return Err(RenderError::Failed {
            code: status.code(),
        });
    }
    Ok(())
}

pub fn render_artifact(
    config: &RenderConfig,
    artifact: &Path,
    out: &Path,
    options: &RenderOptions,
) -> Result<(), RenderError> {
    let raw = fs::read(artifact).map_err(|e| RenderError::io(artifact, e))?;
    let mut data: Value = serde_json::from_slice(&raw).map_err(|source| RenderError::Parse {
        path: artifact.to_path_buf(),
        source,
    })?;
    let mut take = |field: &'static str| {
        data.get_mut(field)
            .map(Value::take)
            .ok_or_else(|| RenderError::MissingField {
                path: artifact.to_path_buf(),
                field,
            })
    };
    let scene = take("struct")?;
    let trace = take("trace")?;
    render(
        config,
        &RenderRequest {
            scene,
            traces: vec![trace],
            out: out.to_path_buf(),
            mode: options.mode,
            theta: options.theta,
            blocks: options.blocks.clone(),
            resolution: options.resolution.unwrap_or(config.resolution),
        },
    )
}

pub fn plan_sources(
    paths: &PathsConfig,
    src: &Path,
) -> Result<(PathBuf, Vec<PathBuf>), RenderError> {
    if src.is_file() {
        let parent = src.parent().unwrap_or_else(|| Path::new(""));
        let out = PathBuf::from(format!("{}_rendered", parent.display()));
        return Ok((out, vec![src.to_path_buf()]));
    }
    let run_dir = paths.towers.join(src);
    let mut towers = Vec::new();
    for entry in WalkDir::new(&run_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&run_dir).to_path_buf();
            RenderError::Io {
                path,
                source: e.into(),
            }
        })?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_json = entry.path().extension().and_then(|s| s.to_str()) == Some("json");
        if entry.file_type().is_file() && is_json && !hidden {
            towers.push(entry.into_path());
        }
    }
    Ok((paths.renders.join(src), towers))
}

pub fn render_sources(
    config: &RenderConfig,
    paths: &PathsConfig,
    src: &Path,
    options: &RenderOptions,
) -> Result<Vec<RenderOutcome>, RenderError> {
    let (out_root, towers) = plan_sources(paths, src)?;
    ensure_dir(&out_root).map_err(|e| RenderError::io(&out_root, e))?;
    info!(towers = towers.len(), out = %out_root.display(), "rendering towers");

    let mut outcomes = Vec::with_capacity(towers.len());
    for tower in towers {
        let name = tower
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let out_dir = out_root.join(&name);
        let error = match render_artifact(config, &tower, &out_dir, options) {
            Ok(()) => None,
            Err(err) => {
                warn!(tower = %name, error = %err, "render failed");
                Some(err.to_string())
            }
        };
        outcomes.push(RenderOutcome {
            tower: name,
            out_dir,
            error,
        });
    }
    Ok(outcomes)
}
