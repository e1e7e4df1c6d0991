use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use sleepmon::config::{LogFormat, SleepmonConfig};
use sleepmon::detect::{Baseline, CooldownState};
use sleepmon::ingest::Metric;
use sleepmon::session::{self, SessionOptions, StartMode};
use sleepmon::storage::{SqliteStore, Store};

#[derive(Parser)]
#[command(
    name = "sleepmon",
    about = "Bedroom environment baseline and anomaly detection",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $SLEEPMON_CONFIG, then /etc/sleepmon/sleepmon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and seed default thresholds
    Init,

    /// Monitor against the stored baseline, calibrating first if there is none
    Run {
        /// JSON-lines readings file, or - for stdin
        #[arg(long, default_value = "-")]
        input: String,
    },

    /// Learn a new baseline from the input, then exit
    Calibrate {
        /// JSON-lines readings file, or - for stdin
        #[arg(long, default_value = "-")]
        input: String,

        /// Finish after this many minutes instead of waiting for SIGUSR1 or end of input
        #[arg(long)]
        minutes: Option<u64>,
    },

    /// Monitor against the stored baseline
    Monitor {
        /// JSON-lines readings file, or - for stdin
        #[arg(long, default_value = "-")]
        input: String,
    },

    /// Show baseline, thresholds and database counts
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recent anomalies
    Anomalies {
        /// Number of entries to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(config: &SleepmonConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run_with_signals(config: &SleepmonConfig, options: SessionOptions, input: &str) -> Result<()> {
    let (tx, rx) = mpsc::channel(8);
    let signals = session::forward_signals(tx)?;
    let outcome = sleepmon::run_session(config, options, input, rx).await;
    signals.abort();

    let outcome = outcome?;
    if outcome.writer.anomalies_lost > 0 {
        anyhow::bail!(
            "{} anomalies could not be written to the database",
            outcome.writer.anomalies_lost
        );
    }
    Ok(())
}

fn print_status(config: &SleepmonConfig, json: bool) -> Result<()> {
    let store = SqliteStore::open(&config.storage.database_path)?;
    let settings = store.settings()?;
    let thresholds = config.effective_thresholds(&settings)?;
    let baseline = Baseline::from_settings(&settings);
    let cooldowns = CooldownState::from_settings(&settings);
    let counts = store.counts()?;
    let last = store.last_session()?;

    if json {
        let out = serde_json::json!({
            "database": config.storage.database_path,
            "baseline": baseline,
            "cooldowns": cooldowns,
            "counts": counts,
            "last_session": last,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("\nsleepmon status ({})", config.storage.database_path.display());
    match &baseline {
        Some(b) => {
            println!(
                "Baseline computed {} from {} to {}{}",
                b.computed_at,
                b.window_start,
                b.window_end,
                if b.low_confidence { " (low confidence)" } else { "" }
            );
            println!("{:<15} | {:>10} | {:>10} | {:>8}", "Metric", "Median", "MAD", "Samples");
            println!("{:-<15}-|-{:->10}-|-{:->10}-|-{:->8}", "", "", "", "");
            for (metric, m) in &b.metrics {
                println!("{:<15} | {:>10.3} | {:>10.4} | {:>8}", metric, m.median, m.mad, m.samples);
            }
        }
        None => println!("Baseline: none (run `sleepmon calibrate`)"),
    }

    println!("\nThresholds: robust_z > {}, cooldown {} min", thresholds.robust_z_threshold, thresholds.cooldown_minutes);
    let show = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_else(|| "-".to_string());
    println!("{:<15} | {:>8} | {:>8} | {:>10} | Last alert", "Metric", "Min", "Max", "ROC/min");
    println!("{:-<15}-|-{:->8}-|-{:->8}-|-{:->10}-|-{:-<25}", "", "", "", "", "");
    for metric in Metric::ALL {
        let l = thresholds.limits(metric);
        let last_alert = cooldowns
            .last_alert(metric)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<15} | {:>8} | {:>8} | {:>10} | {}",
            metric,
            show(l.min),
            show(l.max),
            show(l.roc_limit),
            last_alert
        );
    }

    println!(
        "\nReadings: {}  Minutes: {}  Anomalies: {}  Sessions: {}  Pending reports: {}",
        counts.readings, counts.minute_stats, counts.anomalies, counts.sessions, counts.pending_reports
    );
    if let Some(s) = last {
        println!(
            "Last session {} started {} ({}, {} readings, {} anomalies)",
            s.id,
            s.started_at,
            s.final_state.as_deref().unwrap_or("running"),
            s.readings,
            s.anomalies
        );
    }
    println!();
    Ok(())
}

fn print_anomalies(config: &SleepmonConfig, limit: usize, json: bool) -> Result<()> {
    let store = SqliteStore::open(&config.storage.database_path)?;
    let list = store.recent_anomalies(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }
    if list.is_empty() {
        println!("No anomalies recorded.");
        return Ok(());
    }
    println!("{:<25} | {:<13} | {:<14} | {:>10} | Details", "Time", "Metric", "Rule", "Value");
    println!("{:-<25}-|-{:-<13}-|-{:-<14}-|-{:->10}-|-{:-<40}", "", "", "", "", "");
    for s in list {
        let a = s.anomaly;
        println!(
            "{:<25} | {:<13} | {:<14} | {:>10.2} | {}",
            a.timestamp.to_rfc3339(),
            a.metric,
            a.rule,
            a.value,
            a.details
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SleepmonConfig::resolve(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Init => {
            let added = sleepmon::init_store(&config)?;
            println!(
                "Initialized {} ({} settings added).",
                config.storage.database_path.display(),
                added
            );
        }
        Commands::Run { input } => {
            tracing::info!(%input, "starting session");
            let options = SessionOptions::from_config(&config, StartMode::Auto);
            run_with_signals(&config, options, &input).await?;
        }
        Commands::Calibrate { input, minutes } => {
            tracing::info!(%input, ?minutes, "starting calibration");
            let mut options = SessionOptions::from_config(&config, StartMode::Calibrate);
            options.calibrate_on_eof = true;
            options.stop_after_calibration = true;
            if let Some(m) = minutes {
                options.auto_finish = Some(std::time::Duration::from_secs(m * 60));
            }
            run_with_signals(&config, options, &input).await?;
        }
        Commands::Monitor { input } => {
            tracing::info!(%input, "starting monitoring");
            let options = SessionOptions::from_config(&config, StartMode::Monitor);
            run_with_signals(&config, options, &input).await?;
        }
        Commands::Status { json } => print_status(&config, json)?,
        Commands::Anomalies { limit, json } => print_anomalies(&config, limit, json)?,
    }

    Ok(())
}
