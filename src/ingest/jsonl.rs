//! JSON-lines ingestion.
//!
//! One object per line:
//!
//! ```text
//! {"ts": "2025-01-01T03:00:00Z", "temp_f": 70.1, "humidity": 41.2, "lux": null}
//! ```
//!
//! Missing or `null` fields are absent metrics. Readings whose timestamp is
//! not strictly after the previous accepted reading are rejected here so the
//! detector only ever sees a monotonic stream.

use super::{celsius_to_fahrenheit, Metric, Reading, ReadingSource};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct WireReading {
    ts: DateTime<Utc>,
    temp_f: Option<f64>,
    temp_c: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    lux: Option<f64>,
    full_spectrum: Option<f64>,
    ir: Option<f64>,
    sound_rms: Option<f64>,
}

impl From<WireReading> for Reading {
    fn from(w: WireReading) -> Self {
        let mut r = Reading::new(w.ts);
        r.set(Metric::TempF, w.temp_f.or(w.temp_c.map(celsius_to_fahrenheit)));
        r.set(Metric::Humidity, w.humidity);
        r.set(Metric::Pressure, w.pressure);
        r.set(Metric::Lux, w.lux);
        r.set(Metric::FullSpectrum, w.full_spectrum);
        r.set(Metric::Ir, w.ir);
        r.set(Metric::SoundRms, w.sound_rms);
        r
    }
}

pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: u64,
    last_ts: Option<DateTime<Utc>>,
    rejected: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            last_ts: None,
            rejected: 0,
        }
    }

    /// Lines skipped so far (malformed or out of order).
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[async_trait::async_trait]
impl<R: AsyncBufRead + Unpin + Send> ReadingSource for JsonLinesSource<R> {
    async fn next_reading(&mut self) -> Result<Option<Reading>> {
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .context("failed to read input line")?
        {
            self.line_no += 1;
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let wire: WireReading = match serde_json::from_str(text) {
                Ok(w) => w,
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "skipping malformed reading");
                    self.rejected += 1;
                    continue;
                }
            };

            let reading = Reading::from(wire);
            if let Some(last) = self.last_ts {
                if reading.timestamp <= last {
                    warn!(
                        line = self.line_no,
                        ts = %reading.timestamp,
                        last = %last,
                        "rejecting out-of-order or duplicate reading"
                    );
                    self.rejected += 1;
                    continue;
                }
            }

            self.last_ts = Some(reading.timestamp);
            return Ok(Some(reading));
        }

        debug!(lines = self.line_no, rejected = self.rejected, "input exhausted");
        Ok(None)
    }
}

/// Open `-` (stdin) or a file path as a reading source.
pub async fn open(path: &str) -> Result<Box<dyn ReadingSource>> {
    if path == "-" {
        return Ok(Box::new(JsonLinesSource::new(BufReader::new(tokio::io::stdin()))));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open readings file: {}", path))?;
    Ok(Box::new(JsonLinesSource::new(BufReader::new(file))))
}
