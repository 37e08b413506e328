use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::debug;

use crate::predicate::Predicate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseSpec {
    Footprint([u32; 2]),
    Prebuilt(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSpec {
    pub base: BaseSpec,
    pub size: u32,
    pub shape: [u32; 3],
    pub materials: BTreeMap<String, f64>,
    pub noise: f64,
    pub force: f64,
    pub frames: u32,
}

impl Default for TrialSpec {
    fn default() -> Self {
        Self {
            base: BaseSpec::Footprint([2, 2]),
            size: 10,
            shape: [3, 1, 1],
            materials: BTreeMap::from([("Wood".to_string(), 1.0)]),
            noise: 0.15,
            force: 900.0,
            frames: 240,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Discrete instability class; zero means nothing fell.
    pub instability: f64,
    pub instability_mu: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Stats {
    pub fn new(instability: f64, instability_mu: f64) -> Self {
        Self {
            instability,
            instability_mu,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Per-block positions and orientations over time.
    pub trace: Value,
    pub stats: Stats,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    #[serde(rename = "struct")]
    pub structure: Value,
    pub stats: Stats,
    pub trace: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrialOutcome {
    Accepted { result: TrialResult },
    Rejected,
    /// A collaborator errored or panicked. Counts as a rejection.
    Failed { message: String },
}

impl TrialOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TrialOutcome::Accepted { .. })
    }
}

pub trait Generator: Send + Sync {
    fn generate(&self, spec: &TrialSpec) -> Result<Value>;
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, spec: &TrialSpec, structure: &Value) -> Result<Evaluation>;
}

pub trait TrialRunner: Send + Sync {
    fn run_trial(&self, spec: &TrialSpec) -> TrialOutcome;
}

pub struct TrialPipeline {
    generator: Box<dyn Generator>,
    evaluator: Box<dyn Evaluator>,
    predicate: Predicate,
    debug: bool,
}

impl TrialPipeline {
    /// With `debug` set every evaluated tower is accepted.
    pub fn new(
        generator: Box<dyn Generator>,
        evaluator: Box<dyn Evaluator>,
        predicate: Predicate,
        debug: bool,
    ) -> Self {
        Self {
            generator,
            evaluator,
            predicate,
            debug,
        }
    }

    fn attempt(&self, spec: &TrialSpec) -> Result<TrialOutcome> {
        let structure = self.generator.generate(spec).context("generator failed")?;
        let evaluation = self
            .evaluator
            .evaluate(spec, &structure)
            .context("evaluator failed")?;
        debug!(
            instability = evaluation.stats.instability,
            instability_mu = evaluation.stats.instability_mu,
            "evaluated tower"
        );
        let passed = self.predicate.accepts(&evaluation.stats) || self.debug;
        if !passed {
            return Ok(TrialOutcome::Rejected);
        }
        Ok(TrialOutcome::Accepted {
            result: TrialResult {
                structure,
                stats: evaluation.stats,
                trace: evaluation.trace,
            },
        })
    }
}

impl TrialRunner for TrialPipeline {
    fn run_trial(&self, spec: &TrialSpec) -> TrialOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.attempt(spec))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => TrialOutcome::Failed {
                message: format!("{:#}", err),
            },
            Err(payload) => TrialOutcome::Failed {
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("trial panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("trial panicked: {}", s)
    } else {
        "trial panicked".to_string()
    }
}
