//! sleepmon -- bedroom environment baseline and anomaly detection.
//!
//! This crate provides the robust-statistics detector core, the session
//! driver that feeds it, and the SQLite store, ingestion and reporting
//! adapters around it.

pub mod config;
pub mod detect;
pub mod ingest;
pub mod report;
pub mod session;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use config::SleepmonConfig;
use detect::rules::DEFAULT_SETTINGS;
use report::{ConsoleSink, JsonFileSink, OutboxSink, ReportSink};
use session::{Control, Session, SessionOptions, SessionOutcome};
use storage::{SqliteStore, Store};

/// Create the database and seed threshold settings. Existing entries are
/// left alone; returns how many were added.
pub fn init_store(config: &SleepmonConfig) -> Result<usize> {
    let store = SqliteStore::open(&config.storage.database_path)?;
    let overrides = config.threshold_overrides()?;
    // Validate before anything is written.
    config.effective_thresholds(&Default::default())?;

    let mut seed: Vec<(String, String)> = DEFAULT_SETTINGS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (key, value) in overrides {
        match seed.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => seed.push((key, value)),
        }
    }
    let added = store.seed_settings(&seed)?;
    info!(db = %config.storage.database_path.display(), added, "database initialized");
    Ok(added)
}

/// Sinks enabled by the `[report]` section.
pub fn report_sinks(config: &SleepmonConfig, store: Arc<dyn Store>) -> Vec<Box<dyn ReportSink>> {
    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if config.report.console {
        sinks.push(Box::new(ConsoleSink));
    }
    if let Some(path) = &config.report.json_path {
        sinks.push(Box::new(JsonFileSink::new(path)));
    }
    if config.report.outbox {
        sinks.push(Box::new(OutboxSink::new(store)));
    }
    sinks
}

/// Run one session against the configured database and deliver its report.
pub async fn run_session(
    config: &SleepmonConfig,
    options: SessionOptions,
    input: &str,
    control: tokio::sync::mpsc::Receiver<Control>,
) -> Result<SessionOutcome> {
    // 1. Initialize Storage
    info!(db = %config.storage.database_path.display(), "opening database");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.storage.database_path)?);

    // 2. Open input and start the session
    let mut source = ingest::jsonl::open(input).await?;
    let session = Session::start(Arc::clone(&store), config, options).await?;

    // 3. Drive it to completion
    let outcome = session.run(source.as_mut(), control).await?;

    // 4. Deliver the report
    let sinks = report_sinks(config, store);
    report::deliver_all(&outcome.report, &sinks)
        .await
        .context("report delivery failed")?;

    Ok(outcome)
}
