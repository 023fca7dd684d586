use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use skiff_core::{parse_sinks, LogLevel, RotationFrequency, SkiffConfig};
use skiff_telemetry::{sweep, RotatingLogWriter, SegmentLayout, TelemetrySystem};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(
    after_help = "SINKS:\n  file    Rotating segments under the log directory, shipped when closed\n  stdout  Redacted lines on standard output\n  stderr  Redacted lines on standard error\n  noop    Discard everything\n\nEnvironment variables prefixed with SKIFF_ override the configuration file;\ncommand line flags override both."
)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Set log level")]
    log_level: Option<String>,

    /// Set log directory
    #[arg(long, global = true, help = "Root directory for log segments")]
    log_dir: Option<PathBuf>,

    /// Rotation frequency (hour, minute)
    #[arg(long, global = true, help = "Rotate segments every hour or minute")]
    frequency: Option<String>,

    /// Comma separated sink list
    #[arg(long, global = true, help = "Enabled sinks, e.g. file,stderr")]
    sinks: Option<String>,

    /// Enable shipping of closed segments
    #[arg(long, global = true, help = "Upload closed segments")]
    ship: bool,

    /// Disable shipping of closed segments
    #[arg(
        long,
        global = true,
        conflicts_with = "ship",
        help = "Keep closed segments local"
    )]
    no_ship: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emit demo records through the pipeline
    Emit {
        #[arg(long, default_value_t = 10)]
        count: u32,

        #[arg(long, default_value = "demo record")]
        message: String,

        /// Pause between records, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Print the installation and session identifiers
    Id,

    /// Delete archived and in-flight segments older than the given age
    Sweep {
        #[arg(long, default_value_t = 5)]
        days: u64,
    },

    /// Upload every unshipped segment left in the log directory.
    /// Run it while no other process writes to the same directory.
    Ship,
}

/// Layer command line flags over the loaded configuration
fn apply_overrides(cli: &Cli, config: &mut SkiffConfig) -> Result<()> {
    if let Some(level) = &cli.log_level {
        config.logging.verbosity = level
            .parse::<LogLevel>()
            .with_context(|| format!("Invalid log level '{}'", level))?;
    }

    if let Some(frequency) = &cli.frequency {
        config.logging.frequency = frequency
            .parse::<RotationFrequency>()
            .with_context(|| format!("Invalid rotation frequency '{}'", frequency))?;
    }

    if let Some(sinks) = &cli.sinks {
        config.logging.sinks =
            parse_sinks(sinks).with_context(|| format!("Invalid sink list '{}'", sinks))?;
    }

    if let Some(log_dir) = &cli.log_dir {
        config.logging.directory = log_dir.clone();
    }

    if cli.no_ship {
        config.shipping.enabled = false;
    } else if cli.ship {
        config.shipping.enabled = true;
    }

    Ok(())
}

async fn load_config(cli: &Cli) -> Result<SkiffConfig> {
    let mut config = SkiffConfig::load(cli.config.as_deref()).await?;
    apply_overrides(cli, &mut config)?;
    config.validate()?;
    Ok(config)
}

async fn emit(config: &SkiffConfig, count: u32, message: &str, interval_ms: u64) -> Result<()> {
    let guard = TelemetrySystem::init(config).context("Telemetry initialization failed")?;

    for record in 0..count {
        info!(record, "{}", message);
        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    let segment = guard.writer().map(|writer| writer.layout().active_segment());
    let summary = guard.shutdown().await;

    if let Some(segment) = segment {
        println!("segment: {}", segment.display());
    }
    if let Some(summary) = summary {
        println!(
            "shipping: processed={} uploaded={} failed={}",
            summary.processed, summary.uploaded, summary.failed
        );
    }
    Ok(())
}

fn print_identity(config: &SkiffConfig) -> Result<()> {
    let app = config.app_settings()?;
    println!("installation: {}", app.installation_id);
    println!("session:      {}", app.session_id);
    println!("log root:     {}", config.logging.directory.display());
    Ok(())
}

fn run_sweep(config: &SkiffConfig, days: u64) -> Result<()> {
    let app = config.app_settings()?;
    let layout = SegmentLayout::new(&config.logging.directory, &app);
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
        .unwrap_or(UNIX_EPOCH);

    let report = sweep(&[layout.archives_dir(), layout.tmp_dir()], cutoff);
    println!(
        "removed {} file(s), {} failure(s)",
        report.files_removed, report.removal_failures
    );
    Ok(())
}

async fn ship_pending(config: &SkiffConfig) -> Result<()> {
    if !config.shipping.enabled {
        bail!("Shipping is disabled; enable it in the configuration or pass --ship");
    }

    let app = Arc::new(config.app_settings()?);
    let mut logging = config.logging.clone();
    logging.recovery_horizon_days = 0;

    let writer = RotatingLogWriter::new(app, &logging, &config.shipping)?;
    if !writer.shipping_enabled() {
        bail!("No upload route could be built from the shipping configuration");
    }

    match writer.close().await {
        Some(summary) => println!(
            "processed={} uploaded={} failed={}",
            summary.processed, summary.uploaded, summary.failed
        ),
        None => println!(
            "shipping did not finish within {}s; remaining segments stay in tmp/",
            logging.close_timeout_secs
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables before parsing configuration
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    match &cli.command {
        Command::Emit {
            count,
            message,
            interval_ms,
        } => emit(&config, *count, message, *interval_ms).await,
        Command::Id => print_identity(&config),
        Command::Sweep { days } => run_sweep(&config, *days),
        Command::Ship => ship_pending(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::Sink;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "skiff",
            "--log-level",
            "debug",
            "--frequency",
            "minute",
            "--sinks",
            "file,stderr",
            "--log-dir",
            "/var/log/skiff",
            "--ship",
            "emit",
            "--count",
            "3",
        ])
        .unwrap();

        let mut config = SkiffConfig::default();
        apply_overrides(&cli, &mut config).unwrap();

        assert_eq!(config.logging.verbosity, LogLevel::Debug);
        assert_eq!(config.logging.frequency, RotationFrequency::Minute);
        assert_eq!(config.logging.sinks, vec![Sink::File, Sink::Stderr]);
        assert_eq!(config.logging.directory, PathBuf::from("/var/log/skiff"));
        assert!(config.shipping.enabled);
        assert!(matches!(cli.command, Command::Emit { count: 3, .. }));
    }

    #[test]
    fn test_invalid_flag_values_are_rejected() {
        let cli = Cli::try_parse_from(["skiff", "--frequency", "weekly", "id"]).unwrap();
        let mut config = SkiffConfig::default();
        assert!(apply_overrides(&cli, &mut config).is_err());
    }

    #[test]
    fn test_ship_flags_conflict() {
        assert!(Cli::try_parse_from(["skiff", "--ship", "--no-ship", "id"]).is_err());
    }
}
