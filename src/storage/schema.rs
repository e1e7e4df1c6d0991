//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS readings (
            ts_utc TEXT PRIMARY KEY,
            temp_f REAL,
            humidity REAL,
            pressure REAL,
            lux REAL,
            full_spectrum REAL,
            ir REAL,
            sound_rms REAL
        );

        CREATE TABLE IF NOT EXISTS minute_stats (
            ts_min TEXT NOT NULL,
            metric TEXT NOT NULL,
            rows INTEGER NOT NULL,
            count INTEGER NOT NULL,
            median REAL NOT NULL,
            mad REAL NOT NULL,
            std_dev REAL NOT NULL,
            PRIMARY KEY (ts_min, metric)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            final_state TEXT,
            readings INTEGER NOT NULL DEFAULT 0,
            anomalies INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY,
            session_id TEXT,
            ts_utc TEXT NOT NULL,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            rule TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS reports (
            id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            report_json TEXT NOT NULL,
            dispatched INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_anomalies_ts ON anomalies(ts_utc);
        CREATE INDEX IF NOT EXISTS idx_anomalies_metric ON anomalies(metric);
        CREATE INDEX IF NOT EXISTS idx_reports_pending ON reports(dispatched);",
    )?;

    // Migration: older databases logged anomalies without a session.
    let has_session: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('anomalies') WHERE name='session_id'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_session == 0 {
        conn.execute("ALTER TABLE anomalies ADD COLUMN session_id TEXT", [])?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["config", "readings", "minute_stats", "sessions", "anomalies", "reports"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_migrate_adds_session_column_to_legacy_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE anomalies (
                id INTEGER PRIMARY KEY,
                ts_utc TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                rule TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO anomalies (session_id, ts_utc, metric, value, rule, details)
             VALUES ('s', 't', 'temp_f', 1.0, 'guardrail', 'd')",
            [],
        )
        .unwrap();
    }
}
