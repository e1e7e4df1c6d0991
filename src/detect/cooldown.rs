//! Per-metric alert cooldown.

use crate::ingest::Metric;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub fn setting_key(metric: Metric) -> String {
    format!("last_alert_{}", metric.as_str())
}

/// Timestamp of the last admitted anomaly per metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CooldownState {
    last_alert: BTreeMap<Metric, DateTime<Utc>>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_alert(&self, metric: Metric) -> Option<DateTime<Utc>> {
        self.last_alert.get(&metric).copied()
    }

    /// Restore from `last_alert_<metric>` settings entries. Unparseable
    /// entries are dropped, which re-arms that metric.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        let mut state = Self::new();
        for metric in Metric::ALL {
            let Some(raw) = settings.get(&setting_key(metric)) else {
                continue;
            };
            if raw.is_empty() {
                continue;
            }
            match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => {
                    state.last_alert.insert(metric, ts.with_timezone(&Utc));
                }
                Err(e) => warn!(metric = %metric, value = %raw, error = %e, "ignoring bad cooldown entry"),
            }
        }
        state
    }
}

/// Outcome of offering a candidate to the gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    /// Still inside the window; `remaining` until the metric re-arms.
    Cooling { remaining: Duration },
}

/// Admits at most one anomaly per metric per cooldown window.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    window: Duration,
    state: CooldownState,
}

impl CooldownGate {
    pub fn new(window: Duration, state: CooldownState) -> Self {
        Self { window, state }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> &CooldownState {
        &self.state
    }

    /// Admit when `at - last >= window`. Admission moves the metric's last
    /// alert to `at`.
    pub fn offer(&mut self, metric: Metric, at: DateTime<Utc>) -> Admission {
        if let Some(last) = self.state.last_alert(metric) {
            let elapsed = at - last;
            if elapsed < self.window {
                return Admission::Cooling {
                    remaining: self.window - elapsed,
                };
            }
        }
        self.state.last_alert.insert(metric, at);
        Admission::Admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_within_window_is_suppressed() {
        let mut gate = CooldownGate::new(Duration::minutes(15), CooldownState::new());
        assert_eq!(gate.offer(Metric::TempF, t0()), Admission::Admitted);
        let second = gate.offer(Metric::TempF, t0() + Duration::minutes(14));
        assert_eq!(
            second,
            Admission::Cooling {
                remaining: Duration::minutes(1)
            }
        );
        // Suppression leaves the window anchored at the first admission.
        assert_eq!(gate.state().last_alert(Metric::TempF), Some(t0()));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let mut gate = CooldownGate::new(Duration::minutes(15), CooldownState::new());
        assert_eq!(gate.offer(Metric::TempF, t0()), Admission::Admitted);
        assert_eq!(
            gate.offer(Metric::TempF, t0() + Duration::minutes(15)),
            Admission::Admitted
        );
        assert_eq!(
            gate.state().last_alert(Metric::TempF),
            Some(t0() + Duration::minutes(15))
        );
    }

    #[test]
    fn test_metrics_are_independent() {
        let mut gate = CooldownGate::new(Duration::minutes(15), CooldownState::new());
        assert_eq!(gate.offer(Metric::TempF, t0()), Admission::Admitted);
        assert_eq!(gate.offer(Metric::Humidity, t0()), Admission::Admitted);
    }

    #[test]
    fn test_restore_from_settings() {
        let mut settings = BTreeMap::new();
        settings.insert("last_alert_temp_f".to_string(), t0().to_rfc3339());
        settings.insert("last_alert_humidity".to_string(), "yesterday".to_string());
        settings.insert("last_alert_lux".to_string(), String::new());

        let state = CooldownState::from_settings(&settings);
        assert_eq!(state.last_alert(Metric::TempF), Some(t0()));
        assert_eq!(state.last_alert(Metric::Humidity), None);
        assert_eq!(state.last_alert(Metric::Lux), None);

        let mut gate = CooldownGate::new(Duration::minutes(15), state);
        assert!(matches!(
            gate.offer(Metric::TempF, t0() + Duration::minutes(5)),
            Admission::Cooling { .. }
        ));
    }
}
