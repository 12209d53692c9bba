//! Replica Apply Daemon
//!
//! The `replogd` binary replays archived journal segments into replicas:
//! - Loads the replica-side apply configuration
//! - Runs one apply engine per configured target
//! - Stops all engines on SIGTERM/SIGINT after their current pass
//!
//! # Usage
//!
//! ```bash
//! # Run the targets of a configuration file
//! replogd --config /etc/replog/apply.toml
//!
//! # Show the effective configuration
//! replogd --config /etc/replog/apply.toml --print-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use replog_apply::{ApplyEngine, DumpApplier};
use replog_common::config::{ApplyConfig, ApplyTargetConfig};
use replog_common::{OperationalLog, Shutdown};

/// Replica Apply Daemon
#[derive(Parser, Debug)]
#[command(
    name = "replogd",
    version,
    about = "Replays journal segments into replica databases",
    long_about = "Watches the journal source directory of every configured target and \
                  replays new segments, checkpointing progress in a control file."
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "REPLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "REPLOG_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run(config).await
}

fn init_logging(args: &Args) {
    let level: &str = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_new(log_directives(level)).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Filter directives enabling `level` for every replog crate.
fn log_directives(level: &str) -> String {
    ["replogd", "replog_apply", "replog_encoder", "replog_journal", "replog_common"]
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

fn load_config(args: &Args) -> Result<ApplyConfig> {
    let mut config = match &args.config {
        Some(path) => ApplyConfig::from_file(path).context("Failed to load config file")?,
        None => ApplyConfig::default(),
    };

    if args.verbose {
        config.verbose_logging = true;
    }

    Ok(config)
}

/// Dump file of a target, next to its control files unless configured.
fn dump_path(target: &ApplyTargetConfig) -> PathBuf {
    if let Some(path) = &target.dump_file {
        return path.clone();
    }
    let name: String = target
        .database
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    target.control_directory().join(format!("{}.dump", name))
}

async fn run(config: ApplyConfig) -> Result<()> {
    if config.targets.is_empty() {
        info!("No apply targets configured, nothing to do");
        return Ok(());
    }

    let shutdown = Arc::new(Shutdown::new());
    let mut handles = Vec::with_capacity(config.targets.len());

    for target in &config.targets {
        let oplog = Arc::new(OperationalLog::new(
            config.log_directory.as_deref(),
            target.database.clone(),
            config.verbose_logging,
        ));
        let path = dump_path(target);
        let applier = DumpApplier::open(&path)
            .with_context(|| format!("Failed to open dump file {}", path.display()))?;

        info!("Target {}:", target.database);
        info!("  Source directory: {}", target.journal_source_directory.display());
        info!("  Control directory: {}", target.control_directory().display());
        info!("  Dump file: {}", path.display());

        let mut engine = ApplyEngine::new(target.clone(), applier, oplog, shutdown.clone());
        handles.push(tokio::task::spawn_blocking(move || engine.run()));
    }

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, waiting for apply passes to finish...");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Apply engine panicked: {}", e);
        }
    }

    info!("All apply engines stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
