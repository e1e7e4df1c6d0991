//! Calibration baseline: per-metric robust location and scale.

use crate::detect::{stats, DetectError};
use crate::ingest::{Metric, Reading};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub median: f64,
    pub mad: f64,
    pub std_dev: f64,
    pub samples: usize,
}

/// The room's normal behavior as learned from one calibration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub metrics: BTreeMap<Metric, MetricBaseline>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    /// The calibration window was shorter than recommended.
    pub low_confidence: bool,
}

pub fn setting_key(metric: Metric, field: &str) -> String {
    format!("{}{}_{}", SETTING_PREFIX, metric.as_str(), field)
}

/// Every baseline entry in the settings store starts with this.
pub const SETTING_PREFIX: &str = "baseline_";

pub const COMPUTED_AT_KEY: &str = "baseline_computed_at";
const WINDOW_START_KEY: &str = "baseline_window_start";
const WINDOW_END_KEY: &str = "baseline_window_end";
const LOW_CONFIDENCE_KEY: &str = "baseline_low_confidence";

impl Baseline {
    /// Compute the baseline from every reading collected while calibrating.
    ///
    /// Metrics that never carried a value are left out entirely. Windows
    /// shorter than `recommended` are accepted but flagged low confidence.
    pub fn build(
        readings: &[Reading],
        computed_at: DateTime<Utc>,
        recommended: Duration,
    ) -> Result<Self, DetectError> {
        let (Some(start), Some(end)) = (
            readings.iter().map(|r| r.timestamp).min(),
            readings.iter().map(|r| r.timestamp).max(),
        ) else {
            return Err(DetectError::InsufficientData(
                "no readings were collected during calibration".to_string(),
            ));
        };

        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            let values: Vec<f64> = readings.iter().filter_map(|r| r.get(metric)).collect();
            if values.is_empty() {
                continue;
            }
            let median = stats::median(&values)?;
            metrics.insert(
                metric,
                MetricBaseline {
                    median,
                    mad: stats::mad(&values, median)?,
                    std_dev: stats::stddev(&values)?,
                    samples: values.len(),
                },
            );
        }

        if metrics.is_empty() {
            return Err(DetectError::InsufficientData(format!(
                "{} readings carried no metric values",
                readings.len()
            )));
        }

        let span = end - start;
        let low_confidence = span < recommended;
        if low_confidence {
            warn!(
                span_minutes = span.num_minutes(),
                recommended_minutes = recommended.num_minutes(),
                "calibration window is short; baseline is low confidence"
            );
        }

        for (metric, b) in &metrics {
            info!(
                metric = %metric,
                median = b.median,
                mad = b.mad,
                std_dev = b.std_dev,
                samples = b.samples,
                "baseline computed"
            );
        }

        Ok(Self {
            metrics,
            window_start: start,
            window_end: end,
            computed_at,
            low_confidence,
        })
    }

    pub fn get(&self, metric: Metric) -> Option<&MetricBaseline> {
        self.metrics.get(&metric)
    }

    /// Settings-store entries describing this baseline.
    pub fn to_settings(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (metric, b) in &self.metrics {
            out.push((setting_key(*metric, "median"), b.median.to_string()));
            out.push((setting_key(*metric, "mad"), b.mad.to_string()));
            out.push((setting_key(*metric, "std"), b.std_dev.to_string()));
            out.push((setting_key(*metric, "samples"), b.samples.to_string()));
        }
        out.push((WINDOW_START_KEY.to_string(), self.window_start.to_rfc3339()));
        out.push((WINDOW_END_KEY.to_string(), self.window_end.to_rfc3339()));
        out.push((LOW_CONFIDENCE_KEY.to_string(), self.low_confidence.to_string()));
        out.push((COMPUTED_AT_KEY.to_string(), self.computed_at.to_rfc3339()));
        out
    }

    /// Rebuild a persisted baseline. `None` when `baseline_computed_at` is
    /// missing or no metric has both a median and a MAD entry.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Option<Self> {
        let parse_ts = |key: &str| {
            settings
                .get(key)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            let field = |name: &str| settings.get(&setting_key(metric, name));
            let (Some(median), Some(mad)) = (field("median"), field("mad")) else {
                continue;
            };
            let (Ok(median), Ok(mad)) = (median.parse::<f64>(), mad.parse::<f64>()) else {
                warn!(metric = %metric, "ignoring unparseable baseline entry");
                continue;
            };
            if mad < 0.0 || !median.is_finite() || !mad.is_finite() {
                warn!(metric = %metric, median, mad, "ignoring invalid baseline entry");
                continue;
            }
            metrics.insert(
                metric,
                MetricBaseline {
                    median,
                    mad,
                    std_dev: field("std").and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    samples: field("samples").and_then(|v| v.parse().ok()).unwrap_or(0),
                },
            );
        }

        let Some(computed_at) = parse_ts(COMPUTED_AT_KEY) else {
            if !metrics.is_empty() {
                warn!("baseline entries without {}, ignoring them", COMPUTED_AT_KEY);
            }
            return None;
        };
        if metrics.is_empty() {
            return None;
        }

        Some(Self {
            metrics,
            window_start: parse_ts(WINDOW_START_KEY).unwrap_or(computed_at),
            window_end: parse_ts(WINDOW_END_KEY).unwrap_or(computed_at),
            computed_at,
            low_confidence: settings
                .get(LOW_CONFIDENCE_KEY)
                .map(|v| v == "true")
                .unwrap_or(false),
        })
    }
}

/// Robust statistics for one metric within one minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: usize,
    pub median: f64,
    pub mad: f64,
    pub std_dev: f64,
}

/// Aggregate of all readings sharing one UTC minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteStats {
    pub minute: DateTime<Utc>,
    pub rows: usize,
    pub metrics: BTreeMap<Metric, MetricStats>,
}

pub fn minute_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

impl MinuteStats {
    /// Stats over `readings`, which the caller has already grouped by minute.
    pub fn compute(minute: DateTime<Utc>, readings: &[Reading]) -> Self {
        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            let values: Vec<f64> = readings.iter().filter_map(|r| r.get(metric)).collect();
            // Empty series are the only error case and are skipped above.
            let (Ok(median), Ok(std_dev)) = (stats::median(&values), stats::stddev(&values)) else {
                continue;
            };
            let mad = stats::mad(&values, median).unwrap_or(0.0);
            metrics.insert(
                metric,
                MetricStats {
                    count: values.len(),
                    median,
                    mad,
                    std_dev,
                },
            );
        }
        Self {
            minute,
            rows: readings.len(),
            metrics,
        }
    }

    /// Group readings by UTC minute and summarize each group, oldest first.
    pub fn aggregate(readings: &[Reading]) -> Vec<Self> {
        let mut groups: BTreeMap<DateTime<Utc>, Vec<Reading>> = BTreeMap::new();
        for r in readings {
            groups.entry(minute_of(r.timestamp)).or_default().push(r.clone());
        }
        groups
            .into_iter()
            .map(|(minute, rs)| Self::compute(minute, &rs))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap()
    }

    fn temps(values: &[f64]) -> Vec<Reading> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Reading::new(t0() + Duration::seconds(i as i64)).with(Metric::TempF, *v))
            .collect()
    }

    #[test]
    fn test_build_reference_window() {
        let readings = temps(&[70.0, 70.1, 69.9, 70.0, 95.0]);
        let b = Baseline::build(&readings, t0(), Duration::hours(6)).unwrap();
        let temp = b.get(Metric::TempF).unwrap();
        assert_eq!(temp.median, 70.0);
        assert!((temp.mad - 0.1).abs() < 1e-9);
        assert_eq!(temp.samples, 5);
        assert!(b.low_confidence);
    }

    #[test]
    fn test_build_even_length_median() {
        let readings = temps(&[1.0, 2.0, 3.0, 10.0]);
        let b = Baseline::build(&readings, t0(), Duration::zero()).unwrap();
        assert_eq!(b.get(Metric::TempF).unwrap().median, 2.5);
        assert!(!b.low_confidence);
    }

    #[test]
    fn test_build_empty_is_insufficient() {
        let err = Baseline::build(&[], t0(), Duration::hours(6)).unwrap_err();
        assert!(matches!(err, DetectError::InsufficientData(_)));

        let no_values = vec![Reading::new(t0()), Reading::new(t0() + Duration::seconds(1))];
        let err = Baseline::build(&no_values, t0(), Duration::hours(6)).unwrap_err();
        assert!(matches!(err, DetectError::InsufficientData(_)));
    }

    #[test]
    fn test_absent_metric_is_omitted() {
        let readings: Vec<Reading> = (0..10)
            .map(|i| {
                Reading::new(t0() + Duration::seconds(i))
                    .with(Metric::TempF, 70.0)
                    .with(Metric::Humidity, 40.0 + i as f64)
            })
            .collect();
        let b = Baseline::build(&readings, t0(), Duration::hours(6)).unwrap();
        assert!(b.get(Metric::Lux).is_none());
        assert!(b.get(Metric::SoundRms).is_none());
        assert_eq!(b.get(Metric::TempF).unwrap().mad, 0.0);
        assert_eq!(b.metrics.len(), 2);
    }

    #[test]
    fn test_settings_round_trip() {
        let readings = temps(&[70.0, 70.1, 69.9, 70.0, 95.0]);
        let b = Baseline::build(&readings, t0(), Duration::hours(6)).unwrap();
        let settings: BTreeMap<String, String> = b.to_settings().into_iter().collect();

        assert!(settings.contains_key("baseline_temp_f_median"));
        assert!(settings.contains_key("baseline_temp_f_mad"));
        assert!(!settings.contains_key("baseline_lux_median"));

        let loaded = Baseline::from_settings(&settings).unwrap();
        assert_eq!(loaded, b);
    }

    #[test]
    fn test_from_settings_without_entries() {
        let mut settings = BTreeMap::new();
        settings.insert("robust_z_threshold".to_string(), "6".to_string());
        settings.insert("baseline_temp_f_median".to_string(), "70".to_string());
        assert!(Baseline::from_settings(&settings).is_none());
    }

    #[test]
    fn test_from_settings_requires_computed_at() {
        let readings = temps(&[70.0, 70.1, 69.9]);
        let b = Baseline::build(&readings, t0(), Duration::hours(6)).unwrap();
        let mut settings: BTreeMap<String, String> = b.to_settings().into_iter().collect();
        assert!(settings.keys().all(|k| k.starts_with(SETTING_PREFIX)));

        settings.remove(COMPUTED_AT_KEY);
        assert!(Baseline::from_settings(&settings).is_none());
    }

    #[test]
    fn test_minute_aggregation() {
        let mut readings = Vec::new();
        for i in 0..90 {
            let mut r = Reading::new(t0() + Duration::seconds(i)).with(Metric::TempF, 70.0 + (i % 3) as f64);
            if i >= 60 {
                r.set(Metric::SoundRms, Some(12.0));
            }
            readings.push(r);
        }

        let minutes = MinuteStats::aggregate(&readings);
        assert_eq!(minutes.len(), 2);
        assert_eq!(minutes[0].minute, t0());
        assert_eq!(minutes[0].rows, 60);
        assert!(minutes[0].metrics.get(&Metric::SoundRms).is_none());
        assert_eq!(minutes[1].rows, 30);
        assert_eq!(minutes[1].metrics[&Metric::SoundRms].median, 12.0);
        assert_eq!(minutes[1].metrics[&Metric::TempF].count, 30);
        assert_eq!(minutes[0].metrics[&Metric::TempF].median, 71.0);
    }
}
