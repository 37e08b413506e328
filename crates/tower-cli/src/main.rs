use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tower_search::{
    render::{render_sources, RenderOptions},
    run_search, run_trial_job, Metric, RenderMode, SearchFile, SearchOverrides, SearchRun,
    TrialOutcome,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tower", version = "0.3.0", about = "Block tower rejection-sampling search")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetricArg {
    #[value(name = "stable")]
    Stable,
    #[value(name = "unstable")]
    Unstable,
}

impl From<MetricArg> for Metric {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::Stable => Metric::Stable,
            MetricArg::Unstable => Metric::Unstable,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "none")]
    None,
    #[value(name = "motion")]
    Motion,
    #[value(name = "frozen")]
    Frozen,
    #[value(name = "default")]
    Default,
}

impl From<ModeArg> for RenderMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::None => RenderMode::None,
            ModeArg::Motion => RenderMode::Motion,
            ModeArg::Frozen => RenderMode::Frozen,
            ModeArg::Default => RenderMode::Default,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collect distinct towers that pass the acceptance test.
    Search {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        total: Option<usize>,
        #[arg(long)]
        batch: Option<usize>,
        #[arg(long)]
        size: Option<u32>,
        #[arg(long, num_args = 2, value_names = ["W", "D"])]
        base: Option<Vec<u32>>,
        #[arg(long)]
        base_path: Option<PathBuf>,
        #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
        shape: Option<Vec<u32>>,
        #[arg(long)]
        noise: Option<f64>,
        #[arg(long)]
        force: Option<f64>,
        #[arg(long, value_enum)]
        metric: Option<MetricArg>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        out: Option<String>,
        /// Run trials as a batch-queue array job.
        #[arg(long)]
        slurm: bool,
        /// Accept every evaluated tower.
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run one trial from a staged job file (batch-queue worker).
    Trial {
        #[arg(long)]
        job: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Render saved towers.
    Render {
        #[arg(long)]
        src: PathBuf,
        #[arg(long, value_enum, default_value = "none")]
        mode: ModeArg,
        #[arg(long, num_args = 2, value_names = ["W", "H"])]
        res: Option<Vec<u32>>,
        /// Camera angle in radians.
        #[arg(long, default_value_t = 0.0)]
        theta: f64,
        #[arg(long, num_args = 1..)]
        blocks: Option<Vec<u32>>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration as JSON.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "tower_search=info,tower=info",
        1 => "tower_search=debug,tower=debug",
        _ => "tower_search=trace,tower=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Logs go to stderr so `--json` output stays machine-readable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Search {
            config,
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
            json,
        } => {
            let mut file = SearchFile::load_or_default(config.as_deref())?;
            file.apply(SearchOverrides {
                total,
                batch,
                size,
                base: fixed("--base", base)?,
                base_path,
                shape: fixed("--shape", shape)?,
                noise,
                force,
                metric: metric.map(Into::into),
                threshold,
                out,
                slurm,
                debug,
            });
            let run = run_search(&file)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "search",
                    "run": serde_json::to_value(&run)?,
                })));
            }
            print_search(&run);
        }
        Commands::Trial { job, out, json } => {
            let outcome = run_trial_job(&job, &out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "trial",
                    "out": out.display().to_string(),
                    "outcome": serde_json::to_value(&outcome)?,
                })));
            }
            println!("out: {}", out.display());
            println!("outcome: {}", outcome_label(&outcome));
            if let TrialOutcome::Failed { message } = &outcome {
                println!("error: {}", message);
            }
        }
        Commands::Render {
            src,
            mode,
            res,
            theta,
            blocks,
            config,
            json,
        } => {
            let file = SearchFile::load_or_default(config.as_deref())?;
            let options = RenderOptions {
                mode: mode.into(),
                theta,
                resolution: fixed("--res", res)?,
                blocks,
            };
            let outcomes = render_sources(&file.render, &file.paths, &src, &options)?;
            let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
            if json && failed == 0 {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "render",
                    "rendered": serde_json::to_value(&outcomes)?,
                })));
            }
            if !json {
                for outcome in &outcomes {
                    match &outcome.error {
                        None => println!("{}: {}", outcome.tower, outcome.out_dir.display()),
                        Some(err) => println!("{}: failed: {}", outcome.tower, err),
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} of {} renders failed", failed, outcomes.len()));
            }
            if outcomes.is_empty() {
                println!("no towers found for {}", src.display());
            }
        }
        Commands::Describe { config } => {
            let file = SearchFile::load_or_default(config.as_deref())?;
            file.validate()?;
            return Ok(Some(json!({
                "ok": true,
                "command": "describe",
                "config": serde_json::to_value(&file)?,
                "trial": serde_json::to_value(file.trial_spec()?)?,
            })));
        }
    }
    Ok(None)
}

fn fixed<const N: usize>(flag: &str, values: Option<Vec<u32>>) -> Result<Option<[u32; N]>> {
    values
        .map(|v| {
            <[u32; N]>::try_from(v.as_slice())
                .map_err(|_| anyhow!("{} takes exactly {} values", flag, N))
        })
        .transpose()
}

fn outcome_label(outcome: &TrialOutcome) -> &'static str {
    match outcome {
        TrialOutcome::Accepted { .. } => "accepted",
        TrialOutcome::Rejected => "rejected",
        TrialOutcome::Failed { .. } => "failed",
    }
}

fn print_search(run: &SearchRun) {
    let report = &run.report;
    if report.submitted == 0 && report.filled == report.target {
        println!("All done");
    }
    println!("out_dir: {}", run.out_dir.display());
    println!("backend: {}", run.backend);
    println!("filled: {}", report.filled);
    println!("target: {}", report.target);
    println!("resumed: {}", report.resumed);
    println!("submitted: {}", report.submitted);
    println!("completed: {}", report.completed);
    println!("accepted: {}", report.accepted);
    println!("rejected: {}", report.rejected);
    println!("failed: {}", report.failed);
    println!("duplicates: {}", report.duplicates);
    println!("stale: {}", report.stale);
    println!("persist_failures: {}", report.persist_failures);
    println!("cancelled: {}", report.cancelled);
    println!("elapsed_secs: {:.1}", report.elapsed_secs);
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Search { json, .. }
        | Commands::Trial { json, .. }
        | Commands::Render { json, .. } => *json,
        Commands::Describe { .. } => true,
    }
}
