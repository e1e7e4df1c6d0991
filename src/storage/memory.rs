//! In-memory [`Store`], used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{SessionRecord, Store, StoreCounts, StoredAnomaly};
use crate::detect::baseline::SETTING_PREFIX;
use crate::detect::{Anomaly, MinuteStats};
use crate::ingest::{Metric, Reading};
use crate::report::BatchReport;

#[derive(Default)]
struct Inner {
    settings: BTreeMap<String, String>,
    readings: BTreeMap<DateTime<Utc>, Reading>,
    minute_stats: BTreeMap<(DateTime<Utc>, Metric), usize>,
    anomalies: Vec<StoredAnomaly>,
    sessions: Vec<SessionRecord>,
    reports: Vec<(Uuid, String, String)>,
    failing_anomaly_writes: usize,
    anomaly_write_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` anomaly appends fail.
    pub fn fail_anomaly_writes(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_anomaly_writes = n;
        }
    }

    /// Make every anomaly append take at least `delay`, like a locked database.
    pub fn delay_anomaly_writes(&self, delay: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.anomaly_write_delay = Some(delay);
        }
    }

    /// Anomalies in append order.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.inner
            .lock()
            .map(|inner| inner.anomalies.iter().map(|s| s.anomaly.clone()).collect())
            .unwrap_or_default()
    }

    /// Rendered report bodies in the outbox.
    pub fn outbox(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.reports.iter().map(|(_, _, body)| body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl Store for MemoryStore {
    fn settings(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.lock()?.settings.clone())
    }

    fn set_settings(&self, entries: &[(String, String)]) -> Result<()> {
        let mut inner = self.lock()?;
        for (k, v) in entries {
            inner.settings.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn replace_baseline(&self, entries: &[(String, String)]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.settings.retain(|k, _| !k.starts_with(SETTING_PREFIX));
        for (k, v) in entries {
            inner.settings.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn seed_settings(&self, entries: &[(String, String)]) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut added = 0;
        for (k, v) in entries {
            if !inner.settings.contains_key(k) {
                inner.settings.insert(k.clone(), v.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    fn append_anomaly(&self, session_id: Option<Uuid>, anomaly: &Anomaly) -> Result<()> {
        if let Some(delay) = self.lock()?.anomaly_write_delay {
            std::thread::sleep(delay);
        }
        let mut inner = self.lock()?;
        if inner.failing_anomaly_writes > 0 {
            inner.failing_anomaly_writes -= 1;
            bail!("injected anomaly write failure");
        }
        let id = inner.anomalies.len() as i64 + 1;
        inner.anomalies.push(StoredAnomaly {
            id,
            session_id: session_id.map(|s| s.to_string()),
            anomaly: anomaly.clone(),
        });
        Ok(())
    }

    fn insert_minute_stats(&self, stats: &MinuteStats) -> Result<()> {
        let mut inner = self.lock()?;
        for metric in stats.metrics.keys() {
            inner.minute_stats.insert((stats.minute, *metric), stats.rows);
        }
        Ok(())
    }

    fn insert_reading(&self, reading: &Reading) -> Result<()> {
        self.lock()?
            .readings
            .entry(reading.timestamp)
            .or_insert_with(|| reading.clone());
        Ok(())
    }

    fn open_session(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.sessions.iter().any(|s| s.id == id) {
            inner.sessions.push(SessionRecord {
                id,
                started_at,
                ended_at: None,
                final_state: None,
                readings: 0,
                anomalies: 0,
            });
        }
        Ok(())
    }

    fn save_report(&self, report: &BatchReport, subject: &str, body: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let record = SessionRecord {
            id: report.session_id,
            started_at: report.started_at,
            ended_at: Some(report.ended_at),
            final_state: Some(report.final_state.to_string()),
            readings: report.readings,
            anomalies: report.anomalies.len() as u64,
        };
        match inner.sessions.iter_mut().find(|s| s.id == report.session_id) {
            Some(existing) => *existing = record,
            None => inner.sessions.push(record),
        }
        inner
            .reports
            .push((report.session_id, subject.to_string(), body.to_string()));
        Ok(())
    }

    fn recent_anomalies(&self, limit: usize) -> Result<Vec<StoredAnomaly>> {
        let inner = self.lock()?;
        let mut out = inner.anomalies.clone();
        out.sort_by(|a, b| b.anomaly.timestamp.cmp(&a.anomaly.timestamp).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    fn last_session(&self) -> Result<Option<SessionRecord>> {
        let inner = self.lock()?;
        Ok(inner.sessions.iter().max_by_key(|s| s.started_at).cloned())
    }

    fn counts(&self) -> Result<StoreCounts> {
        let inner = self.lock()?;
        let minutes: std::collections::BTreeSet<_> =
            inner.minute_stats.keys().map(|(m, _)| *m).collect();
        Ok(StoreCounts {
            readings: inner.readings.len() as u64,
            minute_stats: minutes.len() as u64,
            anomalies: inner.anomalies.len() as u64,
            sessions: inner.sessions.len() as u64,
            pending_reports: inner.reports.len() as u64,
        })
    }
}
