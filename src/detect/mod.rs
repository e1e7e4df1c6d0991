//! Baseline calibration and anomaly detection.

pub mod baseline;
pub mod cooldown;
pub mod engine;
pub mod rules;
pub mod stats;

use crate::ingest::Metric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use baseline::{Baseline, MetricBaseline, MinuteStats};
pub use cooldown::{CooldownGate, CooldownState};
pub use engine::{Calibrated, Detector, DetectorState, Evaluation, SuppressReason, Suppression};
pub use rules::{RuleEngine, Thresholds};

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("cannot compute statistics over an empty series")]
    EmptySeries,
    #[error("insufficient calibration data: {0}")]
    InsufficientData(String),
    #[error("calibration already finished; detector is monitoring")]
    AlreadyMonitoring,
}

/// Which rule produced an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Guardrail,
    RateOfChange,
    RobustZScore,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::Guardrail => "guardrail",
            Rule::RateOfChange => "rate_of_change",
            Rule::RobustZScore => "robust_z_score",
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Rule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        [Rule::Guardrail, Rule::RateOfChange, Rule::RobustZScore]
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown rule '{}'", s))
    }
}

/// A rule violation that passed the cooldown gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub metric: Metric,
    pub value: f64,
    pub rule: Rule,
    pub details: String,
}
