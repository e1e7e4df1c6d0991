//! One monitoring session: readings in, anomalies persisted, report out.
//!
//! The driver owns the [`Detector`] and a [`Writer`]. Readings, control
//! signals and the optional auto-finish timer are multiplexed in a single
//! loop, so a reading is always fully handled before the next signal.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SleepmonConfig;
use crate::detect::{cooldown, Baseline, CooldownState, DetectError, Detector, DetectorState};
use crate::ingest::{Reading, ReadingSource};
use crate::report::BatchReport;
use crate::storage::{Store, Writer, WriterStats};

/// Out-of-band requests to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    FinishCalibration,
    Shutdown,
}

/// How a session picks its starting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Always start a fresh calibration.
    Calibrate,
    /// Require a persisted baseline.
    Monitor,
    /// Monitor when a baseline is stored, calibrate otherwise.
    Auto,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: StartMode,
    /// Finish calibration when the input runs out.
    pub calibrate_on_eof: bool,
    /// End the session as soon as calibration succeeds.
    pub stop_after_calibration: bool,
    pub store_readings: bool,
    pub recommended_calibration: chrono::Duration,
    pub auto_finish: Option<std::time::Duration>,
}

impl SessionOptions {
    pub fn from_config(config: &SleepmonConfig, mode: StartMode) -> Self {
        Self {
            mode,
            calibrate_on_eof: false,
            stop_after_calibration: false,
            store_readings: config.storage.store_readings,
            recommended_calibration: config.calibration.recommended(),
            auto_finish: config.calibration.auto_finish(),
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub report: BatchReport,
    pub writer: WriterStats,
    /// Baseline in force when the session ended, if any.
    pub baseline: Option<Baseline>,
}

pub struct Session {
    detector: Detector,
    writer: Writer,
    options: SessionOptions,
}

impl Session {
    /// Load thresholds, cooldowns and any stored baseline, then open the
    /// session record.
    pub async fn start(store: Arc<dyn Store>, config: &SleepmonConfig, options: SessionOptions) -> Result<Self> {
        let settings = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.settings())
                .await
                .context("settings task panicked")??
        };

        let thresholds = config
            .effective_thresholds(&settings)
            .context("invalid threshold configuration")?;
        let cooldowns = CooldownState::from_settings(&settings);
        let stored = Baseline::from_settings(&settings);
        let started_at = Utc::now();

        let detector = match (options.mode, stored) {
            (StartMode::Calibrate, _) | (StartMode::Auto, None) => {
                Detector::calibrating(thresholds, cooldowns, started_at)
            }
            (StartMode::Monitor, None) => {
                bail!("no stored baseline; run `sleepmon calibrate` first")
            }
            (StartMode::Monitor | StartMode::Auto, Some(baseline)) => {
                if baseline.low_confidence {
                    warn!(computed_at = %baseline.computed_at, "stored baseline is low confidence");
                }
                Detector::monitoring(thresholds, baseline, cooldowns, started_at)
            }
        }
        .with_recommended_calibration(options.recommended_calibration);

        let id = detector.session_id();
        {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.open_session(id, started_at))
                .await
                .context("session task panicked")??;
        }

        info!(
            session = %id,
            state = %detector.state(),
            robust_z_threshold = detector.thresholds().robust_z_threshold,
            cooldown_minutes = detector.thresholds().cooldown_minutes,
            "session started"
        );

        let writer = Writer::spawn(store, Some(id));
        Ok(Self {
            detector,
            writer,
            options,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.detector.session_id()
    }

    pub fn state(&self) -> DetectorState {
        self.detector.state()
    }

    /// Drive the session until end of input or a shutdown request.
    pub async fn run(mut self, source: &mut dyn ReadingSource, mut control: mpsc::Receiver<Control>) -> Result<SessionOutcome> {
        let mut control_open = true;
        let mut timer_armed = self.options.auto_finish.is_some() && self.state() == DetectorState::Calibrating;
        // Set once the calibration period has elapsed without a usable window;
        // each later reading retries the finish.
        let mut finish_due = false;
        let timer = tokio::time::sleep(
            self.options
                .auto_finish
                .unwrap_or(std::time::Duration::from_secs(u32::MAX as u64)),
        );
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                ctl = control.recv(), if control_open => match ctl {
                    Some(Control::FinishCalibration) => {
                        if self.finish_calibration().await {
                            timer_armed = false;
                            finish_due = false;
                            if self.options.stop_after_calibration {
                                break;
                            }
                        }
                    }
                    Some(Control::Shutdown) => {
                        info!("shutdown requested");
                        break;
                    }
                    None => control_open = false,
                },

                _ = &mut timer, if timer_armed => {
                    info!("calibration period elapsed");
                    timer_armed = false;
                    if self.finish_calibration().await {
                        if self.options.stop_after_calibration {
                            break;
                        }
                    } else {
                        finish_due = self.state() == DetectorState::Calibrating;
                    }
                }

                next = source.next_reading() => match next {
                    Ok(Some(reading)) => {
                        self.handle(reading).await;
                        if finish_due && self.finish_calibration().await {
                            finish_due = false;
                            if self.options.stop_after_calibration {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        info!(readings = self.detector.readings_seen(), "end of input");
                        if self.options.calibrate_on_eof && self.state() == DetectorState::Calibrating {
                            self.finish_calibration().await;
                        }
                        break;
                    }
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "reading source failed, shutting down");
                        break;
                    }
                },
            }
        }

        self.shutdown().await
    }

    async fn handle(&mut self, reading: Reading) {
        if self.options.store_readings {
            self.writer.reading(reading.clone()).await;
        }

        let eval = self.detector.evaluate(&reading);
        if let Some(minute) = eval.closed_minute {
            self.writer.minute_stats(minute).await;
        }

        for anomaly in eval.admitted {
            warn!(
                metric = %anomaly.metric,
                rule = %anomaly.rule,
                value = anomaly.value,
                details = %anomaly.details,
                "anomaly detected"
            );
            self.writer
                .settings(vec![(
                    cooldown::setting_key(anomaly.metric),
                    anomaly.timestamp.to_rfc3339(),
                )])
                .await;
            if !self.writer.append_anomaly(&anomaly).await {
                warn!(metric = %anomaly.metric, "anomaly queued for retry");
            }
            self.detector.record(anomaly);
        }
    }

    /// Build and persist the baseline. Returns whether the detector is now
    /// monitoring because of this call.
    async fn finish_calibration(&mut self) -> bool {
        match self.detector.finish_calibration(Utc::now()) {
            Ok(done) => {
                if let Some(minute) = done.trailing_minute {
                    self.writer.minute_stats(minute).await;
                }
                self.writer.replace_baseline(done.baseline.to_settings()).await;
                self.writer.flush().await;
                true
            }
            Err(DetectError::AlreadyMonitoring) => {
                warn!("finish-calibration ignored, already monitoring");
                false
            }
            Err(e) => {
                error!(error = %e, "calibration failed, still calibrating");
                false
            }
        }
    }

    async fn shutdown(self) -> Result<SessionOutcome> {
        let baseline = self.detector.baseline().cloned();
        let report = self.detector.shutdown(Utc::now());
        let writer = self.writer.close().await;
        info!(
            session = %report.session_id,
            state = %report.final_state,
            readings = report.readings,
            anomalies = report.anomalies.len(),
            lost = writer.anomalies_lost,
            "session ended"
        );
        Ok(SessionOutcome {
            report,
            writer,
            baseline,
        })
    }
}

/// Forward process signals as [`Control`] messages: SIGUSR1 finishes
/// calibration, SIGINT and SIGTERM shut down.
#[cfg(unix)]
pub fn forward_signals(tx: mpsc::Sender<Control>) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    Ok(tokio::spawn(async move {
        loop {
            let ctl = tokio::select! {
                _ = usr1.recv() => Control::FinishCalibration,
                _ = term.recv() => Control::Shutdown,
                _ = tokio::signal::ctrl_c() => Control::Shutdown,
            };
            info!(control = ?ctl, "signal received");
            if tx.send(ctl).await.is_err() || ctl == Control::Shutdown {
                return;
            }
        }
    }))
}

/// Ctrl-C shuts down; there is no finish-calibration signal off Unix.
#[cfg(not(unix))]
pub fn forward_signals(tx: mpsc::Sender<Control>) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Control::Shutdown).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Rule;
    use crate::ingest::{Metric, ReplaySource};
    use crate::storage::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 23, 0, 0).unwrap()
    }

    fn calm_night(start_secs: i64, n: i64) -> Vec<Reading> {
        (0..n)
            .map(|i| {
                Reading::new(t0() + Duration::seconds(start_secs + i))
                    .with(Metric::TempF, 70.0 + (i % 3) as f64 * 0.01)
                    .with(Metric::Humidity, 40.0 + (i % 5) as f64 * 0.02)
            })
            .collect()
    }

    fn options(mode: StartMode) -> SessionOptions {
        SessionOptions {
            calibrate_on_eof: true,
            ..SessionOptions::from_config(&SleepmonConfig::default(), mode)
        }
    }

    fn no_control() -> mpsc::Receiver<Control> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    /// Yields one reading per `gap` of wall time.
    struct PacedSource {
        readings: std::collections::VecDeque<Reading>,
        gap: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl ReadingSource for PacedSource {
        async fn next_reading(&mut self) -> Result<Option<Reading>> {
            tokio::time::sleep(self.gap).await;
            Ok(self.readings.pop_front())
        }
    }

    fn paced(readings: Vec<Reading>, gap_ms: u64) -> PacedSource {
        PacedSource {
            readings: readings.into(),
            gap: std::time::Duration::from_millis(gap_ms),
        }
    }

    fn timed_options(auto_finish_ms: u64) -> SessionOptions {
        SessionOptions {
            calibrate_on_eof: false,
            auto_finish: Some(std::time::Duration::from_millis(auto_finish_ms)),
            ..SessionOptions::from_config(&SleepmonConfig::default(), StartMode::Calibrate)
        }
    }

    #[tokio::test]
    async fn test_calibrate_on_eof_persists_baseline_and_minutes() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
            .await
            .unwrap();
        let mut source = ReplaySource::new(calm_night(0, 150));
        let outcome = session.run(&mut source, no_control()).await.unwrap();

        assert_eq!(outcome.report.final_state, DetectorState::Monitoring);
        assert!(outcome.report.anomalies.is_empty());
        let baseline = outcome.baseline.unwrap();
        assert!((baseline.get(Metric::TempF).unwrap().median - 70.01).abs() < 1e-9);

        let settings = store.settings().unwrap();
        assert!(settings.contains_key("baseline_temp_f_median"));
        assert!(settings.contains_key("baseline_computed_at"));
        // Two closed minutes plus the trailing one.
        assert_eq!(store.counts().unwrap().minute_stats, 3);
    }

    #[tokio::test]
    async fn test_monitor_requires_baseline() {
        let store = Arc::new(MemoryStore::new());
        let err = Session::start(store, &SleepmonConfig::default(), options(StartMode::Monitor)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_monitor_persists_anomaly_before_report() {
        let store = Arc::new(MemoryStore::new());
        let calib = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
            .await
            .unwrap();
        calib
            .run(&mut ReplaySource::new(calm_night(0, 300)), no_control())
            .await
            .unwrap();

        let session = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Auto))
            .await
            .unwrap();
        assert_eq!(session.state(), DetectorState::Monitoring);

        let mut readings = calm_night(3600, 10);
        readings.push(Reading::new(t0() + Duration::seconds(3700)).with(Metric::Humidity, 86.0));
        let outcome = session
            .run(&mut ReplaySource::new(readings), no_control())
            .await
            .unwrap();

        assert_eq!(outcome.report.anomalies.len(), 1);
        assert_eq!(outcome.report.anomalies[0].rule, Rule::Guardrail);
        assert_eq!(store.anomalies(), outcome.report.anomalies);
        assert!(store.settings().unwrap().contains_key("last_alert_humidity"));
    }

    #[tokio::test]
    async fn test_cooldown_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let spike = |offset: i64| Reading::new(t0() + Duration::seconds(offset)).with(Metric::SoundRms, 150.0);

        for offset in [0, 300] {
            let session = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
                .await
                .unwrap();
            session
                .run(&mut ReplaySource::new(vec![spike(offset)]), no_control())
                .await
                .unwrap();
        }
        // Second spike is five minutes after the first, inside the 15 minute window.
        assert_eq!(store.anomalies().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_control_ends_session() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Control::Shutdown).await.unwrap();

        let outcome = session
            .run(&mut ReplaySource::new(calm_night(0, 100)), rx)
            .await
            .unwrap();
        // Control is polled first, so nothing was read.
        assert_eq!(outcome.report.readings, 0);
        assert_eq!(outcome.report.final_state, DetectorState::Calibrating);
    }

    #[tokio::test]
    async fn test_failed_anomaly_write_is_retried_at_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.fail_anomaly_writes(1);
        let session = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
            .await
            .unwrap();
        let reading = Reading::new(t0()).with(Metric::Humidity, 90.0);
        let outcome = session
            .run(&mut ReplaySource::new(vec![reading]), no_control())
            .await
            .unwrap();

        assert_eq!(outcome.report.anomalies.len(), 1);
        assert_eq!(outcome.writer.anomalies_retried, 1);
        assert_eq!(store.anomalies().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_finish_survives_early_signal() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::start(store.clone(), &SleepmonConfig::default(), timed_options(100))
            .await
            .unwrap();
        // Lands before any reading, so this finish attempt fails.
        let (tx, rx) = mpsc::channel(4);
        tx.send(Control::FinishCalibration).await.unwrap();

        let outcome = session.run(&mut paced(calm_night(0, 10), 30), rx).await.unwrap();
        assert_eq!(outcome.report.final_state, DetectorState::Monitoring);
        assert!(Baseline::from_settings(&store.settings().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_elapsed_timer_retries_on_next_reading() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::start(store.clone(), &SleepmonConfig::default(), timed_options(20))
            .await
            .unwrap();

        // Nothing has arrived when the timer fires; the first reading completes calibration.
        let outcome = session.run(&mut paced(calm_night(0, 3), 80), no_control()).await.unwrap();
        assert_eq!(outcome.report.final_state, DetectorState::Monitoring);
        assert_eq!(outcome.baseline.unwrap().get(Metric::TempF).unwrap().samples, 1);
    }

    #[tokio::test]
    async fn test_recalibration_drops_removed_sensor() {
        let store = Arc::new(MemoryStore::new());
        let with_lux: Vec<Reading> = calm_night(0, 120)
            .into_iter()
            .map(|r| r.with(Metric::Lux, 5.0))
            .collect();
        let first = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
            .await
            .unwrap();
        let outcome = first.run(&mut ReplaySource::new(with_lux), no_control()).await.unwrap();
        assert!(outcome.baseline.unwrap().get(Metric::Lux).is_some());

        // The lux sensor is gone for the second calibration.
        let second = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Calibrate))
            .await
            .unwrap();
        second
            .run(&mut ReplaySource::new(calm_night(1000, 120)), no_control())
            .await
            .unwrap();
        assert!(!store.settings().unwrap().contains_key("baseline_lux_median"));

        let monitor = Session::start(store.clone(), &SleepmonConfig::default(), options(StartMode::Monitor))
            .await
            .unwrap();
        let stray = Reading::new(t0() + Duration::seconds(5000)).with(Metric::Lux, 20000.0);
        let outcome = monitor.run(&mut ReplaySource::new(vec![stray]), no_control()).await.unwrap();
        let baseline = outcome.baseline.unwrap();
        assert!(baseline.get(Metric::Lux).is_none());
        assert!(baseline.get(Metric::TempF).is_some());
        assert!(outcome.report.anomalies.is_empty());
    }
}
