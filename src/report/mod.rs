//! End-of-session batch report and its delivery sinks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::detect::{Anomaly, DetectorState};
use crate::storage::Store;

/// Everything a session admitted, flushed once at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_state: DetectorState,
    pub readings: u64,
    /// Insertion order.
    pub anomalies: Vec<Anomaly>,
}

fn fmt_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn subject(&self) -> String {
        if self.is_empty() {
            "Sleep Monitor Night Summary - No Anomalies Detected".to_string()
        } else {
            format!(
                "Sleep Monitor Night Summary - {} Anomaly(ies) Detected",
                self.anomalies.len()
            )
        }
    }

    /// Plain-text night summary.
    pub fn render_text(&self) -> String {
        let mut body = String::from("SLEEP MONITOR NIGHT SUMMARY\n\n");
        body.push_str(&format!("Time: {}\n", fmt_time(self.ended_at)));
        body.push_str(&format!(
            "Session: {} to {} ({} readings)\n",
            fmt_time(self.started_at),
            fmt_time(self.ended_at),
            self.readings
        ));
        if self.final_state == DetectorState::Calibrating {
            body.push_str("Note: calibration never finished; only guardrail and rate-of-change rules ran\n");
        }

        if self.is_empty() {
            body.push_str("Status: No anomalies detected\n");
        } else {
            body.push_str(&format!("Total Anomalies: {}\n", self.anomalies.len()));
            for (i, a) in self.anomalies.iter().enumerate() {
                body.push_str(&format!("\n{}. {} ANOMALY\n", i + 1, a.metric.as_str().to_uppercase()));
                body.push_str(&format!("   Time: {}\n", fmt_time(a.timestamp)));
                body.push_str(&format!("   Value: {} {}\n", a.value, a.metric.unit()));
                body.push_str(&format!("   Rule: {}\n", a.rule));
                body.push_str(&format!("   Details: {}\n", a.details));
            }
        }

        body.push_str("\n---\nSleep Monitor System");
        body
    }
}

/// Somewhere a finished report goes.
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, report: &BatchReport) -> Result<()>;
}

/// Prints the text summary to stdout.
pub struct ConsoleSink;

#[async_trait]
impl ReportSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn deliver(&self, report: &BatchReport) -> Result<()> {
        println!("{}", report.render_text());
        Ok(())
    }
}

/// Writes the report as pretty JSON.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    fn name(&self) -> &'static str {
        "json_file"
    }

    async fn deliver(&self, report: &BatchReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to write report to {}", self.path.display()))?;
        info!(path = %self.path.display(), "report written");
        Ok(())
    }
}

/// Queues the rendered summary in the store for an external mailer and
/// closes out the session row.
pub struct OutboxSink {
    store: Arc<dyn Store>,
}

impl OutboxSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReportSink for OutboxSink {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn deliver(&self, report: &BatchReport) -> Result<()> {
        let store = Arc::clone(&self.store);
        let report = report.clone();
        tokio::task::spawn_blocking(move || {
            store.save_report(&report, &report.subject(), &report.render_text())
        })
        .await
        .context("outbox task panicked")??;
        Ok(())
    }
}

/// Hand the report to every sink. A failing sink does not stop the others;
/// the first error is returned after all have run.
pub async fn deliver_all(report: &BatchReport, sinks: &[Box<dyn ReportSink>]) -> Result<()> {
    let mut first_err = None;
    for sink in sinks {
        if let Err(e) = sink.deliver(report).await {
            tracing::error!(sink = sink.name(), error = %format!("{:#}", e), "report delivery failed");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Rule;
    use crate::ingest::Metric;
    use crate::storage::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 23, 0, 0).unwrap()
    }

    fn report(anomalies: Vec<Anomaly>) -> BatchReport {
        BatchReport {
            session_id: Uuid::new_v4(),
            started_at: t0(),
            ended_at: t0() + Duration::hours(8),
            final_state: DetectorState::Monitoring,
            readings: 28_800,
            anomalies,
        }
    }

    fn humidity() -> Anomaly {
        Anomaly {
            timestamp: t0() + Duration::hours(2),
            metric: Metric::Humidity,
            value: 85.2,
            rule: Rule::Guardrail,
            details: "Value 85.2% above maximum 85.0%".to_string(),
        }
    }

    #[test]
    fn test_empty_report_renders_no_anomalies() {
        let r = report(vec![]);
        let text = r.render_text();
        assert!(text.starts_with("SLEEP MONITOR NIGHT SUMMARY"));
        assert!(text.contains("Status: No anomalies detected"));
        assert!(text.contains("Time: 2025-01-02 07:00:00 UTC"));
        assert!(!text.contains("Total Anomalies"));
        assert_eq!(r.subject(), "Sleep Monitor Night Summary - No Anomalies Detected");
    }

    #[test]
    fn test_report_lists_anomalies_in_order() {
        let mut second = humidity();
        second.metric = Metric::SoundRms;
        second.value = 120.0;
        let r = report(vec![humidity(), second]);
        let text = r.render_text();

        assert!(text.contains("Total Anomalies: 2"));
        let first_pos = text.find("1. HUMIDITY ANOMALY").unwrap();
        let second_pos = text.find("2. SOUND_RMS ANOMALY").unwrap();
        assert!(first_pos < second_pos);
        assert!(text.contains("   Rule: guardrail"));
        assert!(text.contains("   Time: 2025-01-02 01:00:00 UTC"));
        assert!(text.ends_with("Sleep Monitor System"));
        assert_eq!(r.subject(), "Sleep Monitor Night Summary - 2 Anomaly(ies) Detected");
    }

    #[test]
    fn test_uncalibrated_session_is_noted() {
        let mut r = report(vec![]);
        r.final_state = DetectorState::Calibrating;
        assert!(r.render_text().contains("calibration never finished"));
    }

    #[tokio::test]
    async fn test_json_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("night.json");
        let r = report(vec![humidity()]);
        JsonFileSink::new(&path).deliver(&r).await.unwrap();

        let loaded: BatchReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, r);
    }

    #[tokio::test]
    async fn test_outbox_sink_queues_rendered_text() {
        let store = Arc::new(MemoryStore::new());
        let sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(OutboxSink::new(store.clone()))];
        deliver_all(&report(vec![humidity()]), &sinks).await.unwrap();

        let outbox = store.outbox();
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].contains("1. HUMIDITY ANOMALY"));
        assert_eq!(store.counts().unwrap().sessions, 1);
    }
}
