//! SQLite storage layer -- schema, settings store, anomaly log, outbox.

pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod writer;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use uuid::Uuid;

use crate::detect::{Anomaly, MinuteStats};
use crate::ingest::Reading;
use crate::report::BatchReport;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use writer::{Writer, WriterStats};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory database, mostly for tests.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory().with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// An anomaly as read back from the durable log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAnomaly {
    pub id: i64,
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub anomaly: Anomaly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreCounts {
    pub readings: u64,
    pub minute_stats: u64,
    pub anomalies: u64,
    pub sessions: u64,
    pub pending_reports: u64,
}

/// Row in the `sessions` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub final_state: Option<String>,
    pub readings: u64,
    pub anomalies: u64,
}

/// Durable side of the monitor: settings store, append-only anomaly log,
/// minute-stats archive and report outbox.
///
/// Implementations are synchronous; async callers go through [`Writer`] or
/// `spawn_blocking`.
pub trait Store: Send + Sync {
    fn settings(&self) -> Result<BTreeMap<String, String>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.settings()?.remove(key))
    }

    /// Upsert all entries in one transaction, in order.
    fn set_settings(&self, entries: &[(String, String)]) -> Result<()>;

    /// Drop every stored `baseline_*` entry and write `entries` in its place,
    /// in one transaction.
    fn replace_baseline(&self, entries: &[(String, String)]) -> Result<()>;

    /// Insert entries whose key is missing; returns how many were added.
    fn seed_settings(&self, entries: &[(String, String)]) -> Result<usize>;

    fn append_anomaly(&self, session_id: Option<Uuid>, anomaly: &Anomaly) -> Result<()>;

    /// Idempotent per (minute, metric).
    fn insert_minute_stats(&self, stats: &MinuteStats) -> Result<()>;

    /// Raw reading archive; duplicates by timestamp are ignored.
    fn insert_reading(&self, reading: &Reading) -> Result<()>;

    fn open_session(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()>;

    /// Close the session row and queue the rendered report in the outbox.
    fn save_report(&self, report: &BatchReport, subject: &str, body: &str) -> Result<()>;

    /// Newest first.
    fn recent_anomalies(&self, limit: usize) -> Result<Vec<StoredAnomaly>>;

    fn last_session(&self) -> Result<Option<SessionRecord>>;

    fn counts(&self) -> Result<StoreCounts>;
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp '{}'", raw))?
        .with_timezone(&Utc))
}
