//! Sensor readings and the ingestion boundary.
//!
//! Physical drivers (BME280, TSL2591, INMP441) live outside this crate. They
//! hand readings over as JSON lines; this module turns those into ordered
//! [`Reading`] values for the detector.

pub mod jsonl;

use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;

pub use jsonl::JsonLinesSource;

/// Every metric the sampling collaborators can produce.
///
/// Declaration order is the evaluation order of the rule engine and therefore
/// the order anomalies appear in a batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TempF,
    Humidity,
    Pressure,
    Lux,
    FullSpectrum,
    Ir,
    SoundRms,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::TempF,
        Metric::Humidity,
        Metric::Pressure,
        Metric::Lux,
        Metric::FullSpectrum,
        Metric::Ir,
        Metric::SoundRms,
    ];

    /// Canonical column / settings name, e.g. `temp_f`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TempF => "temp_f",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::Lux => "lux",
            Metric::FullSpectrum => "full_spectrum",
            Metric::Ir => "ir",
            Metric::SoundRms => "sound_rms",
        }
    }

    /// Prefix used by threshold keys (`temp_max`, `sound_roc_limit`, ...).
    pub fn threshold_prefix(&self) -> &'static str {
        match self {
            Metric::TempF => "temp",
            Metric::SoundRms => "sound",
            other => other.as_str(),
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::TempF => "°F",
            Metric::Humidity => "%",
            Metric::Pressure => "hPa",
            Metric::Lux => "lx",
            Metric::FullSpectrum | Metric::Ir => "counts",
            Metric::SoundRms => "rms",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown metric '{}'", s))
    }
}

/// One sample across all installed sensors.
///
/// A metric missing from `values` means its sensor is not installed (or did
/// not answer); it is never stored as zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    values: BTreeMap<Metric, f64>,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(0),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter. Non-finite values are dropped.
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, Some(value));
        self
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        match value {
            Some(v) if v.is_finite() => {
                self.values.insert(metric, v);
            }
            _ => {
                self.values.remove(&metric);
            }
        }
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    /// Present metrics in evaluation order.
    pub fn metrics(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.values.iter().map(|(m, v)| (*m, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Anything that yields readings in non-decreasing timestamp order.
#[async_trait::async_trait]
pub trait ReadingSource: Send {
    /// Next reading, or `None` once the source is exhausted.
    async fn next_reading(&mut self) -> Result<Option<Reading>>;
}

/// Replays an in-memory batch of readings.
#[derive(Debug, Default)]
pub struct ReplaySource {
    queue: VecDeque<Reading>,
}

impl ReplaySource {
    pub fn new(readings: impl IntoIterator<Item = Reading>) -> Self {
        Self {
            queue: readings.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl ReadingSource for ReplaySource {
    async fn next_reading(&mut self) -> Result<Option<Reading>> {
        Ok(self.queue.pop_front())
    }
}
