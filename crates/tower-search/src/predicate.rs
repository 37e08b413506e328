use serde::{Deserialize, Serialize};
use std::fmt;

use crate::trial::Stats;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Stable,
    Unstable,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Stable => "stable",
            Metric::Unstable => "unstable",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acceptance test applied to evaluator statistics.
///
/// - `stable`: nothing fell (`instability == 0`) and the mean instability is
///   strictly below the threshold.
/// - `unstable`: both the instability class and its mean reach the threshold.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub metric: Metric,
    pub threshold: f64,
}

impl Predicate {
    pub fn new(metric: Metric, threshold: f64) -> Self {
        Self { metric, threshold }
    }

    pub fn accepts(&self, stats: &Stats) -> bool {
        match self.metric {
            Metric::Stable => stats.instability == 0.0 && stats.instability_mu < self.threshold,
            Metric::Unstable => {
                stats.instability >= self.threshold && stats.instability_mu >= self.threshold
            }
        }
    }
}
