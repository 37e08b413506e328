use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::trial::{Evaluation, Evaluator, Generator, TrialSpec};

pub struct CommandGenerator {
    command: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, workdir: Option<PathBuf>) -> Self {
        Self { command, workdir }
    }
}

impl Generator for CommandGenerator {
    fn generate(&self, spec: &TrialSpec) -> Result<Value> {
        let input = serde_json::to_vec(spec)?;
        run_collaborator(&self.command, self.workdir.as_deref(), &input)
    }
}

pub struct CommandEvaluator {
    command: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandEvaluator {
    pub fn new(command: Vec<String>, workdir: Option<PathBuf>) -> Self {
        Self { command, workdir }
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, spec: &TrialSpec, structure: &Value) -> Result<Evaluation> {
        let input = json!({
            "struct": structure,
            "noise": spec.noise,
            "force": spec.force,
            "frames": spec.frames,
        });
        let output = run_collaborator(
            &self.command,
            self.workdir.as_deref(),
            &serde_json::to_vec(&input)?,
        )?;
        serde_json::from_value(output).context("evaluator output must contain `trace` and `stats`")
    }
}

fn run_collaborator(command: &[String], workdir: Option<&Path>, input: &[u8]) -> Result<Value> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("collaborator command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start `{}`", program))?;
    if let Some(mut stdin) = child.stdin.take() {
        // A tool that ignores its input may close stdin early.
        let _ = stdin.write_all(input);
    }
    let output = child.wait_with_output()?;

    if !output.status.success() {
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string();
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        bail!("`{}` exited with status {}: {}", program, status, stderr_tail);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str::<Value>(l).ok())
        .ok_or_else(|| anyhow!("`{}` printed no JSON result", program))
}
