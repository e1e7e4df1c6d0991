//! Two-state detector: calibrate, then monitor.
//!
//! The detector is pure in-memory state. It never touches storage; callers
//! persist what [`Evaluation`] and [`Calibrated`] hand back.

use crate::detect::baseline::{minute_of, Baseline, MinuteStats};
use crate::detect::cooldown::{Admission, CooldownGate, CooldownState};
use crate::detect::rules::{RuleEngine, Thresholds};
use crate::detect::{Anomaly, DetectError, Rule};
use crate::ingest::{Metric, Reading};
use crate::report::BatchReport;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Calibrating,
    Monitoring,
}

impl std::fmt::Display for DetectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorState::Calibrating => write!(f, "calibrating"),
            DetectorState::Monitoring => write!(f, "monitoring"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuppressReason {
    Cooldown { remaining: Duration },
    /// An earlier rule already claimed this metric on the same reading.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suppression {
    pub metric: Metric,
    pub rule: Rule,
    pub reason: SuppressReason,
}

/// Result of evaluating one reading.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Anomalies that passed the cooldown gate, in metric order.
    pub admitted: Vec<Anomaly>,
    pub suppressed: Vec<Suppression>,
    /// Set while calibrating when this reading opened a new minute.
    pub closed_minute: Option<MinuteStats>,
}

/// Output of a successful calibration.
#[derive(Debug)]
pub struct Calibrated {
    pub baseline: Baseline,
    /// Stats for the partially filled last minute of the window.
    pub trailing_minute: Option<MinuteStats>,
}

#[derive(Debug, Default)]
struct CalibrationWindow {
    readings: Vec<Reading>,
    minute: Option<DateTime<Utc>>,
    minute_start: usize,
}

impl CalibrationWindow {
    fn push(&mut self, reading: Reading) -> Option<MinuteStats> {
        let minute = minute_of(reading.timestamp);
        let closed = match self.minute {
            Some(current) if current != minute => Some(self.close(current)),
            _ => None,
        };
        if self.minute != Some(minute) {
            self.minute = Some(minute);
            self.minute_start = self.readings.len();
        }
        self.readings.push(reading);
        closed
    }

    fn close(&self, minute: DateTime<Utc>) -> MinuteStats {
        MinuteStats::compute(minute, &self.readings[self.minute_start..])
    }

    fn trailing(&self) -> Option<MinuteStats> {
        self.minute
            .filter(|_| self.minute_start < self.readings.len())
            .map(|m| self.close(m))
    }
}

#[derive(Debug)]
enum Mode {
    Calibrating(CalibrationWindow),
    Monitoring(Baseline),
}

pub struct Detector {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    thresholds: Thresholds,
    recommended_calibration: Duration,
    rules: RuleEngine,
    gate: CooldownGate,
    mode: Mode,
    readings_seen: u64,
    anomalies: Vec<Anomaly>,
}

impl Detector {
    /// New session in calibration mode.
    pub fn calibrating(thresholds: Thresholds, cooldown: CooldownState, started_at: DateTime<Utc>) -> Self {
        Self::with_mode(thresholds, cooldown, started_at, Mode::Calibrating(CalibrationWindow::default()))
    }

    /// New session that monitors against an existing baseline.
    pub fn monitoring(
        thresholds: Thresholds,
        baseline: Baseline,
        cooldown: CooldownState,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::with_mode(thresholds, cooldown, started_at, Mode::Monitoring(baseline))
    }

    fn with_mode(thresholds: Thresholds, cooldown: CooldownState, started_at: DateTime<Utc>, mode: Mode) -> Self {
        let gate = CooldownGate::new(thresholds.cooldown(), cooldown);
        Self {
            session_id: Uuid::new_v4(),
            started_at,
            thresholds,
            recommended_calibration: Duration::hours(6),
            rules: RuleEngine::new(),
            gate,
            mode,
            readings_seen: 0,
            anomalies: Vec::new(),
        }
    }

    /// Calibration windows shorter than this produce a low-confidence baseline.
    pub fn with_recommended_calibration(mut self, recommended: Duration) -> Self {
        self.recommended_calibration = recommended;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> DetectorState {
        match self.mode {
            Mode::Calibrating(_) => DetectorState::Calibrating,
            Mode::Monitoring(_) => DetectorState::Monitoring,
        }
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        match &self.mode {
            Mode::Monitoring(b) => Some(b),
            Mode::Calibrating(_) => None,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn cooldown_state(&self) -> &CooldownState {
        self.gate.state()
    }

    /// Readings buffered for calibration so far.
    pub fn calibration_len(&self) -> usize {
        match &self.mode {
            Mode::Calibrating(w) => w.readings.len(),
            Mode::Monitoring(_) => 0,
        }
    }

    pub fn readings_seen(&self) -> u64 {
        self.readings_seen
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Run the rules and the cooldown gate for one reading.
    ///
    /// Admitted anomalies are returned but not yet accumulated; call
    /// [`Detector::record`] once they have been handed to the durable log.
    pub fn evaluate(&mut self, reading: &Reading) -> Evaluation {
        self.readings_seen += 1;
        let mut eval = Evaluation::default();

        if let Mode::Calibrating(window) = &mut self.mode {
            eval.closed_minute = window.push(reading.clone());
        }
        let baseline = match &self.mode {
            Mode::Monitoring(b) => Some(b),
            Mode::Calibrating(_) => None,
        };

        let ts = reading.timestamp;
        for (metric, value) in reading.metrics() {
            // Metrics the baseline never saw are out of scope once monitoring.
            if baseline.is_some_and(|b| b.get(metric).is_none()) {
                continue;
            }
            let mut candidates = self
                .rules
                .evaluate(ts, metric, value, &self.thresholds, baseline)
                .into_iter();
            let Some(first) = candidates.next() else {
                continue;
            };

            match self.gate.offer(metric, ts) {
                Admission::Admitted => eval.admitted.push(first.into_anomaly(ts)),
                Admission::Cooling { remaining } => {
                    debug!(
                        metric = %metric,
                        rule = %first.rule,
                        remaining_secs = remaining.num_seconds(),
                        "suppressed by cooldown"
                    );
                    eval.suppressed.push(Suppression {
                        metric,
                        rule: first.rule,
                        reason: SuppressReason::Cooldown { remaining },
                    });
                }
            }

            for dup in candidates {
                debug!(metric = %metric, rule = %dup.rule, "suppressed duplicate");
                eval.suppressed.push(Suppression {
                    metric,
                    rule: dup.rule,
                    reason: SuppressReason::Duplicate,
                });
            }
        }

        eval
    }

    /// Append an admitted anomaly to the session accumulator.
    pub fn record(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }

    /// Evaluate and immediately accumulate, for callers without a durable log.
    pub fn process(&mut self, reading: &Reading) -> Evaluation {
        let eval = self.evaluate(reading);
        self.anomalies.extend(eval.admitted.iter().cloned());
        eval
    }

    /// Build the baseline from everything buffered and switch to monitoring.
    ///
    /// On failure the detector stays in calibration with its buffer intact.
    pub fn finish_calibration(&mut self, now: DateTime<Utc>) -> Result<Calibrated, DetectError> {
        let Mode::Calibrating(window) = &self.mode else {
            return Err(DetectError::AlreadyMonitoring);
        };

        let baseline = Baseline::build(&window.readings, now, self.recommended_calibration)?;
        let trailing_minute = window.trailing();

        info!(
            session = %self.session_id,
            readings = window.readings.len(),
            metrics = baseline.metrics.len(),
            low_confidence = baseline.low_confidence,
            "calibration finished, monitoring"
        );

        self.mode = Mode::Monitoring(baseline.clone());
        Ok(Calibrated {
            baseline,
            trailing_minute,
        })
    }

    /// End the session, flushing the accumulator as one report.
    pub fn shutdown(self, ended_at: DateTime<Utc>) -> BatchReport {
        let final_state = self.state();
        BatchReport {
            session_id: self.session_id,
            started_at: self.started_at,
            ended_at,
            final_state,
            readings: self.readings_seen,
            anomalies: self.anomalies,
        }
    }
}
