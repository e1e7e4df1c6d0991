//! TOML configuration for sleepmon.
//!
//! Every section is optional and falls back to compiled-in defaults. The
//! config file is located from, in order: an explicit `--config` path, the
//! `SLEEPMON_CONFIG` environment variable, `/etc/sleepmon/sleepmon.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::Thresholds;

pub const CONFIG_ENV: &str = "SLEEPMON_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sleepmon/sleepmon.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the monitor process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SleepmonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Threshold overrides, same keys as the settings store.
    #[serde(default)]
    pub thresholds: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SleepmonConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded sleepmon configuration");
        Ok(config)
    }

    /// Try the environment variable, then the system location, then defaults.
    pub fn load_or_default() -> Self {
        // 1. Environment variable override.
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SLEEPMON_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        // 2. Standard system location.
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        // 3. Defaults.
        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; otherwise fall back as in [`Self::load_or_default`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// The `[thresholds]` table as settings-store strings.
    pub fn threshold_overrides(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.thresholds
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::String(s) => s.clone(),
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: key.clone(),
                            value: other.to_string(),
                        })
                    }
                };
                Ok((key.clone(), text))
            })
            .collect()
    }

    /// Compiled defaults, then the config file, then `settings` from the store.
    pub fn effective_thresholds(
        &self,
        settings: &BTreeMap<String, String>,
    ) -> Result<Thresholds, ConfigError> {
        let overrides = self.threshold_overrides()?;
        let mut thresholds = Thresholds::from_settings(&overrides)?;
        thresholds.overlay(settings)?;
        Ok(thresholds)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Archive every raw reading, not just minute stats and anomalies.
    pub store_readings: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/sleepmon.db"),
            store_readings: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Windows shorter than this yield a low-confidence baseline.
    pub recommended_hours: f64,
    /// Finish calibration automatically after this many minutes of wall time.
    /// Unset means wait for SIGUSR1 or end of input.
    pub auto_finish_minutes: Option<u64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            recommended_hours: 6.0,
            auto_finish_minutes: None,
        }
    }
}

impl CalibrationConfig {
    pub fn recommended(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.recommended_hours.max(0.0) * 3600.0) as i64)
    }

    pub fn auto_finish(&self) -> Option<std::time::Duration> {
        self.auto_finish_minutes
            .map(|m| std::time::Duration::from_secs(m * 60))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Where the end-of-session report goes. Every enabled sink receives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Print the plain-text summary to stdout.
    pub console: bool,
    /// Write the report as JSON to this file.
    pub json_path: Option<PathBuf>,
    /// Queue the rendered summary in the `reports` table for an external mailer.
    pub outbox: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            console: true,
            json_path: None,
            outbox: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Metric;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SleepmonConfig::default();
        assert_eq!(cfg.storage.database_path, PathBuf::from("data/sleepmon.db"));
        assert!(!cfg.storage.store_readings);
        assert_eq!(cfg.calibration.recommended(), chrono::Duration::hours(6));
        assert!(cfg.calibration.auto_finish().is_none());
        assert!(cfg.report.console);
        assert!(cfg.report.outbox);
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert!(cfg.thresholds.is_empty());
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[calibration]
auto_finish_minutes = 90

[thresholds]
temp_max = 88
humidity_max = 80.5
lux_max = ""

[logging]
format = "json"
"#
        )
        .unwrap();

        let cfg = SleepmonConfig::load(f.path()).unwrap();
        assert_eq!(cfg.calibration.recommended_hours, 6.0);
        assert_eq!(
            cfg.calibration.auto_finish(),
            Some(std::time::Duration::from_secs(90 * 60))
        );
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.report.console);

        let t = cfg.effective_thresholds(&BTreeMap::new()).unwrap();
        assert_eq!(t.limits(Metric::TempF).max, Some(88.0));
        assert_eq!(t.limits(Metric::Humidity).max, Some(80.5));
        assert_eq!(t.limits(Metric::Lux).max, None);
    }

    #[test]
    fn test_store_settings_override_file() {
        let mut cfg = SleepmonConfig::default();
        cfg.thresholds
            .insert("temp_max".to_string(), toml::Value::Integer(88));
        let mut settings = BTreeMap::new();
        settings.insert("temp_max".to_string(), "85".to_string());

        let t = cfg.effective_thresholds(&settings).unwrap();
        assert_eq!(t.limits(Metric::TempF).max, Some(85.0));
    }

    #[test]
    fn test_non_numeric_threshold_is_rejected() {
        let mut cfg = SleepmonConfig::default();
        cfg.thresholds
            .insert("cooldown_minutes".to_string(), toml::Value::Boolean(true));
        assert!(matches!(
            cfg.threshold_overrides(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut cfg = SleepmonConfig::default();
        cfg.thresholds.insert(
            "robust_z_threshold".to_string(),
            toml::Value::String("high".to_string()),
        );
        assert!(cfg.effective_thresholds(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(SleepmonConfig::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[storage\ndatabase_path = 3").unwrap();
        assert!(SleepmonConfig::load(f.path()).is_err());
    }
}
