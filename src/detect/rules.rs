//! Per-metric anomaly rules.
//!
//! Three independent checks, always evaluated in the same order:
//! guardrail, rate of change, robust z-score. Each is a pure function over a
//! single value plus context; [`RuleEngine`] only remembers the previous value
//! per metric for the rate-of-change check.

use crate::config::ConfigError;
use crate::detect::baseline::{Baseline, MetricBaseline};
use crate::detect::{stats, Anomaly, Rule};
use crate::ingest::Metric;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Guardrail and rate-of-change limits for one metric. `None` disables the
/// corresponding check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricLimits {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Maximum absolute change per minute.
    pub roc_limit: Option<f64>,
}

/// Detection thresholds for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub robust_z_threshold: f64,
    pub cooldown_minutes: f64,
    pub limits: BTreeMap<Metric, MetricLimits>,
}

/// Compiled-in defaults, keyed the same way as the settings store.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("robust_z_threshold", "6"),
    ("temp_roc_limit", "3"),
    ("humidity_roc_limit", "8"),
    ("lux_roc_limit", "100"),
    ("sound_roc_limit", "10"),
    ("temp_min", "50"),
    ("temp_max", "90"),
    ("humidity_min", "10"),
    ("humidity_max", "85"),
    ("lux_min", "0"),
    ("lux_max", "10000"),
    ("sound_min", "0"),
    ("sound_max", "100"),
    ("cooldown_minutes", "15"),
];

impl Default for Thresholds {
    fn default() -> Self {
        let mut t = Self {
            robust_z_threshold: 0.0,
            cooldown_minutes: 0.0,
            limits: BTreeMap::new(),
        };
        for (key, value) in DEFAULT_SETTINGS {
            let applied = t.apply(key, value);
            debug_assert!(matches!(applied, Ok(true)), "bad default {}={}", key, value);
        }
        t
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64, ConfigError> {
    let n: f64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    if !n.is_finite() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(n)
}

/// Per-metric bounds accept an empty value (or `none`) to switch the check off.
fn parse_optional(key: &str, value: &str) -> Result<Option<f64>, ConfigError> {
    let v = value.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_number(key, v).map(Some)
}

impl Thresholds {
    /// Defaults overlaid with `settings`. Keys that are not thresholds
    /// (baseline entries, cooldown timestamps, ...) are ignored.
    pub fn from_settings<'a, I>(settings: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut t = Self::default();
        t.overlay(settings)?;
        Ok(t)
    }

    pub fn overlay<'a, I>(&mut self, settings: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in settings {
            self.apply(key, value)?;
        }
        self.validate()
    }

    /// Apply a single `key=value`; returns whether the key was a threshold.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key {
            "robust_z_threshold" => {
                self.robust_z_threshold = parse_number(key, value)?;
                return Ok(true);
            }
            "cooldown_minutes" => {
                self.cooldown_minutes = parse_number(key, value)?;
                return Ok(true);
            }
            _ => {}
        }

        for metric in Metric::ALL {
            let Some(field) = key
                .strip_prefix(metric.threshold_prefix())
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                continue;
            };
            if !matches!(field, "min" | "max" | "roc_limit") {
                continue;
            }
            let parsed = parse_optional(key, value)?;
            let limits = self.limits.entry(metric).or_default();
            match field {
                "min" => limits.min = parsed,
                "max" => limits.max = parsed,
                _ => limits.roc_limit = parsed,
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.robust_z_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "robust_z_threshold must be positive, got {}",
                self.robust_z_threshold
            )));
        }
        if self.cooldown_minutes < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cooldown_minutes must not be negative, got {}",
                self.cooldown_minutes
            )));
        }
        for (metric, l) in &self.limits {
            if let (Some(min), Some(max)) = (l.min, l.max) {
                if min > max {
                    return Err(ConfigError::Invalid(format!(
                        "{} guardrail min {} exceeds max {}",
                        metric, min, max
                    )));
                }
            }
            if matches!(l.roc_limit, Some(r) if r <= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{}_roc_limit must be positive",
                    metric.threshold_prefix()
                )));
            }
        }
        Ok(())
    }

    pub fn limits(&self, metric: Metric) -> MetricLimits {
        self.limits.get(&metric).copied().unwrap_or_default()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::milliseconds((self.cooldown_minutes * 60_000.0).round() as i64)
    }
}

/// A rule violation before the cooldown gate has had its say.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub metric: Metric,
    pub value: f64,
    pub rule: Rule,
    pub details: String,
}

impl Candidate {
    pub fn into_anomaly(self, timestamp: DateTime<Utc>) -> Anomaly {
        Anomaly {
            timestamp,
            metric: self.metric,
            value: self.value,
            rule: self.rule,
            details: self.details,
        }
    }
}

fn with_unit(metric: Metric, v: f64) -> String {
    let unit = metric.unit();
    if unit.starts_with('°') || unit == "%" {
        format!("{:.1}{}", v, unit)
    } else {
        format!("{:.1} {}", v, unit)
    }
}

pub fn guardrail(metric: Metric, value: f64, limits: &MetricLimits) -> Option<Candidate> {
    let details = match (limits.min, limits.max) {
        (Some(min), _) if value < min => format!(
            "Value {} below minimum {}",
            with_unit(metric, value),
            with_unit(metric, min)
        ),
        (_, Some(max)) if value > max => format!(
            "Value {} above maximum {}",
            with_unit(metric, value),
            with_unit(metric, max)
        ),
        _ => return None,
    };
    Some(Candidate {
        metric,
        value,
        rule: Rule::Guardrail,
        details,
    })
}

/// Fires when the per-minute rate since `previous` exceeds `limit`. The
/// elapsed time comes from the timestamps, so gaps in sampling are honored.
pub fn rate_of_change(
    metric: Metric,
    value: f64,
    now: DateTime<Utc>,
    previous: Option<(DateTime<Utc>, f64)>,
    limit: Option<f64>,
) -> Option<Candidate> {
    let (limit, (prev_ts, prev_value)) = (limit?, previous?);
    let elapsed_minutes = (now - prev_ts).num_milliseconds() as f64 / 60_000.0;
    if elapsed_minutes <= 0.0 {
        return None;
    }
    let delta = value - prev_value;
    let rate = delta.abs() / elapsed_minutes;
    if rate <= limit {
        return None;
    }
    Some(Candidate {
        metric,
        value,
        rule: Rule::RateOfChange,
        details: format!(
            "Changed {:+.2} in {:.2} min ({:.2}/min, limit {}/min; {} -> {})",
            delta,
            elapsed_minutes,
            rate,
            limit,
            with_unit(metric, prev_value),
            with_unit(metric, value)
        ),
    })
}

pub fn robust_z_score(
    metric: Metric,
    value: f64,
    baseline: Option<&MetricBaseline>,
    threshold: f64,
) -> Option<Candidate> {
    let b = baseline?;
    let z = stats::robust_z(value, b.median, b.mad);
    if z <= threshold {
        return None;
    }
    Some(Candidate {
        metric,
        value,
        rule: Rule::RobustZScore,
        details: format!(
            "Z-score: {:.2} (threshold: {}; median {}, MAD {:.3})",
            z,
            threshold,
            with_unit(metric, b.median),
            b.mad
        ),
    })
}

/// Runs the rules for one metric of one reading and remembers the value for
/// the next rate-of-change check.
#[derive(Debug, Default)]
pub struct RuleEngine {
    previous: BTreeMap<Metric, (DateTime<Utc>, f64)>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates in rule order. `baseline` is `None` while calibrating.
    pub fn evaluate(
        &mut self,
        timestamp: DateTime<Utc>,
        metric: Metric,
        value: f64,
        thresholds: &Thresholds,
        baseline: Option<&Baseline>,
    ) -> Vec<Candidate> {
        let limits = thresholds.limits(metric);
        let previous = self.previous.insert(metric, (timestamp, value));

        [
            guardrail(metric, value, &limits),
            rate_of_change(metric, value, timestamp, previous, limits.roc_limit),
            robust_z_score(
                metric,
                value,
                baseline.and_then(|b| b.get(metric)),
                thresholds.robust_z_threshold,
            ),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
