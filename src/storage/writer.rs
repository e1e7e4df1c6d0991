//! Ordered persistence queue.
//!
//! All writes for a session go through one task that drains a FIFO channel and
//! runs each store call on the blocking pool. Anomaly appends are acknowledged
//! to the caller, who waits at most [`ACK_WAIT`] so a locked database cannot
//! stall intake. Failed appends stay queued and are retried ahead of every
//! later write and once more when the writer closes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::Store;
use crate::detect::{Anomaly, MinuteStats};
use crate::ingest::Reading;

const QUEUE_DEPTH: usize = 1024;

/// Longest the caller waits for an anomaly append to be acknowledged.
pub const ACK_WAIT: Duration = Duration::from_millis(250);

enum WriteOp {
    Anomaly {
        anomaly: Anomaly,
        ack: oneshot::Sender<bool>,
    },
    MinuteStats(MinuteStats),
    Reading(Reading),
    Settings(Vec<(String, String)>),
    Baseline(Vec<(String, String)>),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriterStats {
    pub anomalies_written: u64,
    /// Appends that failed at least once and later succeeded.
    pub anomalies_retried: u64,
    /// Appends still failing when the writer closed.
    pub anomalies_lost: u64,
    /// Non-anomaly writes that failed. These are not retried.
    pub failed_writes: u64,
}

pub struct Writer {
    tx: mpsc::Sender<WriteOp>,
    task: JoinHandle<WriterStats>,
}

impl Writer {
    pub fn spawn(store: Arc<dyn Store>, session_id: Option<Uuid>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(run(store, session_id, rx));
        Self { tx, task }
    }

    /// Queue an anomaly and wait until the store has it, up to [`ACK_WAIT`].
    /// `false` means the write failed or is still in flight; either way it
    /// stays queued and will be retried.
    pub async fn append_anomaly(&self, anomaly: &Anomaly) -> bool {
        let (ack, done) = oneshot::channel();
        let op = WriteOp::Anomaly {
            anomaly: anomaly.clone(),
            ack,
        };
        if self.tx.send(op).await.is_err() {
            error!(metric = %anomaly.metric, "writer is gone, anomaly not persisted");
            return false;
        }
        match tokio::time::timeout(ACK_WAIT, done).await {
            Ok(ack) => ack.unwrap_or(false),
            Err(_) => {
                warn!(metric = %anomaly.metric, "anomaly write still in flight, not waiting");
                false
            }
        }
    }

    pub async fn minute_stats(&self, stats: MinuteStats) {
        self.send(WriteOp::MinuteStats(stats)).await;
    }

    pub async fn reading(&self, reading: Reading) {
        self.send(WriteOp::Reading(reading)).await;
    }

    pub async fn settings(&self, entries: Vec<(String, String)>) {
        self.send(WriteOp::Settings(entries)).await;
    }

    /// Swap the stored baseline for `entries`.
    pub async fn replace_baseline(&self, entries: Vec<(String, String)>) {
        self.send(WriteOp::Baseline(entries)).await;
    }

    /// Wait until everything queued so far has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(WriteOp::Flush(tx)).await;
        let _ = rx.await;
    }

    /// Drain the queue, retry outstanding anomalies, and stop.
    pub async fn close(self) -> WriterStats {
        drop(self.tx);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "writer task failed");
                WriterStats::default()
            }
        }
    }

    async fn send(&self, op: WriteOp) {
        if self.tx.send(op).await.is_err() {
            error!("writer is gone, dropping write");
        }
    }
}

async fn blocking<T, F>(store: &Arc<dyn Store>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .context("storage task panicked")?
}

async fn write_anomaly(store: &Arc<dyn Store>, session_id: Option<Uuid>, anomaly: &Anomaly) -> Result<()> {
    let anomaly = anomaly.clone();
    blocking(store, move |s| s.append_anomaly(session_id, &anomaly)).await
}

/// Retry queued anomalies in order, stopping at the first that still fails.
async fn retry_pending(
    store: &Arc<dyn Store>,
    session_id: Option<Uuid>,
    pending: &mut VecDeque<Anomaly>,
    stats: &mut WriterStats,
) {
    while let Some(anomaly) = pending.front() {
        match write_anomaly(store, session_id, anomaly).await {
            Ok(()) => {
                debug!(metric = %anomaly.metric, "queued anomaly persisted on retry");
                stats.anomalies_written += 1;
                stats.anomalies_retried += 1;
                pending.pop_front();
            }
            Err(e) => {
                warn!(pending = pending.len(), error = %e, "anomaly retry failed");
                return;
            }
        }
    }
}

async fn run(store: Arc<dyn Store>, session_id: Option<Uuid>, mut rx: mpsc::Receiver<WriteOp>) -> WriterStats {
    let mut pending: VecDeque<Anomaly> = VecDeque::new();
    let mut stats = WriterStats::default();

    while let Some(op) = rx.recv().await {
        retry_pending(&store, session_id, &mut pending, &mut stats).await;

        let result = match op {
            WriteOp::Anomaly { anomaly, ack } => {
                // Later anomalies wait behind earlier failures to keep the log ordered.
                let written = if pending.is_empty() {
                    match write_anomaly(&store, session_id, &anomaly).await {
                        Ok(()) => true,
                        Err(e) => {
                            error!(metric = %anomaly.metric, rule = %anomaly.rule, error = %e, "failed to persist anomaly, will retry");
                            false
                        }
                    }
                } else {
                    false
                };
                if written {
                    stats.anomalies_written += 1;
                } else {
                    pending.push_back(anomaly);
                }
                let _ = ack.send(written);
                Ok(())
            }
            WriteOp::MinuteStats(m) => {
                let minute = m.minute;
                blocking(&store, move |s| s.insert_minute_stats(&m))
                    .await
                    .with_context(|| format!("minute stats for {}", minute))
            }
            WriteOp::Reading(r) => blocking(&store, move |s| s.insert_reading(&r))
                .await
                .context("reading archive"),
            WriteOp::Settings(entries) => blocking(&store, move |s| s.set_settings(&entries))
                .await
                .context("settings update"),
            WriteOp::Baseline(entries) => blocking(&store, move |s| s.replace_baseline(&entries))
                .await
                .context("baseline update"),
            WriteOp::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };

        if let Err(e) = result {
            stats.failed_writes += 1;
            error!(error = %format!("{:#}", e), "storage write failed");
        }
    }

    retry_pending(&store, session_id, &mut pending, &mut stats).await;
    stats.anomalies_lost = pending.len() as u64;
    if !pending.is_empty() {
        error!(lost = pending.len(), "anomalies could not be persisted before shutdown");
    }
    stats
}
