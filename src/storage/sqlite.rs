//! [`Store`] over the SQLite connection pool.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::{open_memory_pool, open_pool, parse_ts, Pool, SessionRecord, Store, StoreCounts, StoredAnomaly};
use crate::detect::baseline::SETTING_PREFIX;
use crate::detect::{Anomaly, MinuteStats};
use crate::ingest::{Metric, Reading};
use crate::report::BatchReport;

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn count(conn: &rusqlite::Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

impl Store for SqliteStore {
    fn settings(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set_settings(&self, entries: &[(String, String)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_baseline(&self, entries: &[(String, String)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM config WHERE substr(key, 1, ?1) = ?2",
            params![SETTING_PREFIX.len() as i64, SETTING_PREFIX],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        debug!(removed, written = entries.len(), "baseline replaced");
        Ok(())
    }

    fn seed_settings(&self, entries: &[(String, String)]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")?;
            for (key, value) in entries {
                added += stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    fn append_anomaly(&self, session_id: Option<Uuid>, a: &Anomaly) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO anomalies (session_id, ts_utc, metric, value, rule, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id.map(|id| id.to_string()),
                a.timestamp.to_rfc3339(),
                a.metric.as_str(),
                a.value,
                a.rule.as_str(),
                a.details
            ],
        )
        .context("failed to append anomaly")?;
        Ok(())
    }

    fn insert_minute_stats(&self, m: &MinuteStats) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO minute_stats (ts_min, metric, rows, count, median, mad, std_dev)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let minute = m.minute.to_rfc3339();
            for (metric, s) in &m.metrics {
                stmt.execute(params![
                    minute,
                    metric.as_str(),
                    m.rows as i64,
                    s.count as i64,
                    s.median,
                    s.mad,
                    s.std_dev
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_reading(&self, r: &Reading) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO readings
                (ts_utc, temp_f, humidity, pressure, lux, full_spectrum, ir, sound_rms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                r.timestamp.to_rfc3339(),
                r.get(Metric::TempF),
                r.get(Metric::Humidity),
                r.get(Metric::Pressure),
                r.get(Metric::Lux),
                r.get(Metric::FullSpectrum),
                r.get(Metric::Ir),
                r.get(Metric::SoundRms)
            ],
        )?;
        Ok(())
    }

    fn open_session(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, started_at) VALUES (?1, ?2)",
            params![id.to_string(), started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn save_report(&self, report: &BatchReport, subject: &str, body: &str) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let id = report.session_id.to_string();
        tx.execute(
            "INSERT INTO sessions (id, started_at, ended_at, final_state, readings, anomalies)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                ended_at = excluded.ended_at,
                final_state = excluded.final_state,
                readings = excluded.readings,
                anomalies = excluded.anomalies",
            params![
                id,
                report.started_at.to_rfc3339(),
                report.ended_at.to_rfc3339(),
                report.final_state.to_string(),
                report.readings as i64,
                report.anomalies.len() as i64
            ],
        )?;
        tx.execute(
            "INSERT INTO reports (session_id, subject, body, report_json) VALUES (?1, ?2, ?3, ?4)",
            params![id, subject, body, json],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn recent_anomalies(&self, limit: usize) -> Result<Vec<StoredAnomaly>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, ts_utc, metric, value, rule, details
             FROM anomalies ORDER BY ts_utc DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, session_id, ts, metric, value, rule, details)| {
                Ok(StoredAnomaly {
                    id,
                    session_id,
                    anomaly: Anomaly {
                        timestamp: parse_ts(&ts)?,
                        metric: metric.parse()?,
                        value,
                        rule: rule.parse()?,
                        details,
                    },
                })
            })
            .collect()
    }

    fn last_session(&self) -> Result<Option<SessionRecord>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, started_at, ended_at, final_state, readings, anomalies
                 FROM sessions ORDER BY started_at DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, started, ended, final_state, readings, anomalies)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            id: Uuid::parse_str(&id).with_context(|| format!("bad session id '{}'", id))?,
            started_at: parse_ts(&started)?,
            ended_at: ended.as_deref().map(parse_ts).transpose()?,
            final_state,
            readings: readings.max(0) as u64,
            anomalies: anomalies.max(0) as u64,
        }))
    }

    fn counts(&self) -> Result<StoreCounts> {
        let conn = self.pool.get()?;
        Ok(StoreCounts {
            readings: count(&conn, "SELECT COUNT(*) FROM readings")?,
            minute_stats: count(&conn, "SELECT COUNT(DISTINCT ts_min) FROM minute_stats")?,
            anomalies: count(&conn, "SELECT COUNT(*) FROM anomalies")?,
            sessions: count(&conn, "SELECT COUNT(*) FROM sessions")?,
            pending_reports: count(&conn, "SELECT COUNT(*) FROM reports WHERE dispatched = 0")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorState, Rule};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap()
    }

    fn anomaly(offset_min: i64, metric: Metric) -> Anomaly {
        Anomaly {
            timestamp: t0() + Duration::minutes(offset_min),
            metric,
            value: 91.0,
            rule: Rule::Guardrail,
            details: "Value 91.0°F above maximum 90.0°F".to_string(),
        }
    }

    #[test]
    fn test_replace_baseline_drops_stale_metrics() {
        let store = SqliteStore::in_memory().unwrap();
        let kv = |k: &str, v: &str| (k.to_string(), v.to_string());
        store
            .set_settings(&[
                kv("temp_max", "90"),
                kv("last_alert_lux", "2025-01-01T03:00:00+00:00"),
                kv("baseline_lux_median", "5"),
                kv("baseline_lux_mad", "0"),
                kv("baseline_temp_f_median", "68"),
            ])
            .unwrap();

        store
            .replace_baseline(&[kv("baseline_temp_f_median", "70"), kv("baseline_temp_f_mad", "0.1")])
            .unwrap();

        let settings = store.settings().unwrap();
        assert_eq!(settings.get("baseline_temp_f_median").map(String::as_str), Some("70"));
        assert!(!settings.contains_key("baseline_lux_median"));
        assert!(!settings.contains_key("baseline_lux_mad"));
        assert!(settings.contains_key("temp_max"));
        assert!(settings.contains_key("last_alert_lux"));
    }

    #[test]
    fn test_settings_seed_does_not_clobber() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_settings(&[("temp_max".to_string(), "88".to_string())])
            .unwrap();
        let added = store
            .seed_settings(&[
                ("temp_max".to_string(), "90".to_string()),
                ("temp_min".to_string(), "50".to_string()),
            ])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.get_setting("temp_max").unwrap().as_deref(), Some("88"));
        assert_eq!(store.settings().unwrap().len(), 2);
        assert_eq!(store.get_setting("missing").unwrap(), None);
    }

    #[test]
    fn test_anomaly_log_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let session = Uuid::new_v4();
        store.append_anomaly(Some(session), &anomaly(0, Metric::TempF)).unwrap();
        store.append_anomaly(None, &anomaly(5, Metric::Humidity)).unwrap();

        let recent = store.recent_anomalies(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].anomaly, anomaly(5, Metric::Humidity));
        assert_eq!(recent[0].session_id, None);
        assert_eq!(recent[1].session_id, Some(session.to_string()));
        assert_eq!(store.recent_anomalies(1).unwrap().len(), 1);
    }

    #[test]
    fn test_minute_stats_are_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let readings: Vec<Reading> = (0..30)
            .map(|i| Reading::new(t0() + Duration::seconds(i)).with(Metric::TempF, 70.0))
            .collect();
        let stats = MinuteStats::compute(t0(), &readings);
        store.insert_minute_stats(&stats).unwrap();
        store.insert_minute_stats(&stats).unwrap();
        assert_eq!(store.counts().unwrap().minute_stats, 1);
    }

    #[test]
    fn test_readings_ignore_duplicate_timestamps() {
        let store = SqliteStore::in_memory().unwrap();
        let r = Reading::new(t0()).with(Metric::Lux, 3.0);
        store.insert_reading(&r).unwrap();
        store.insert_reading(&r).unwrap();
        assert_eq!(store.counts().unwrap().readings, 1);
    }

    #[test]
    fn test_report_closes_session_and_queues_outbox() {
        let store = SqliteStore::in_memory().unwrap();
        let id = Uuid::new_v4();
        store.open_session(id, t0()).unwrap();

        let report = BatchReport {
            session_id: id,
            started_at: t0(),
            ended_at: t0() + Duration::hours(8),
            final_state: DetectorState::Monitoring,
            readings: 28_800,
            anomalies: vec![anomaly(30, Metric::TempF)],
        };
        store.save_report(&report, "subject", "body").unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.sessions, 1);
        assert_eq!(counts.pending_reports, 1);

        let last = store.last_session().unwrap().unwrap();
        assert_eq!(last.id, id);
        assert_eq!(last.ended_at, Some(t0() + Duration::hours(8)));
        assert_eq!(last.final_state.as_deref(), Some("monitoring"));
        assert_eq!(last.anomalies, 1);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sleepmon.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set_settings(&[("cooldown_minutes".to_string(), "20".to_string())])
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_setting("cooldown_minutes").unwrap().as_deref(), Some("20"));
    }
}
