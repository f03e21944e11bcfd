//! conduitd — the Conduit fleet daemon.
//!
//! # Usage
//!
//! ```text
//! conduitd run --config /etc/conduit-fleet/conduit.toml
//! conduitd status --config /etc/conduit-fleet/conduit.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conduit_core::ConfigSource;
use conduit_state::StateStore;
use conduitd::commands;
use conduitd::daemon::{self, Services};

const DEFAULT_CONFIG: &str = "/etc/conduit-fleet/conduit.toml";

#[derive(Parser)]
#[command(name = "conduitd", about = "Conduit fleet telemetry and self-healing daemon", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker, status, watchdog and notification loops until Ctrl-C.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Query every worker once and print the fleet status.
    Status {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print persisted per-country traffic and live peers (stop the daemon first).
    ///
    /// The running daemon holds an exclusive lock on the state file, so this
    /// fails with "is the daemon running?" while `conduitd run` is active.
    Countries {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Clear the per-country counters, keeping the geo cache (stop the daemon first).
    ///
    /// The running daemon holds an exclusive lock on the state file. Stop it,
    /// reset, then start it again.
    ResetCounters {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate the config file and print the effective values.
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,conduitd=debug,conduit=debug"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Status { config } => commands::status(&config).await,
        Command::Countries { config } => commands::countries(&config),
        Command::ResetCounters { config } => commands::reset_counters(&config),
        Command::CheckConfig { config } => commands::check_config(&config),
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = ?config_path, "conduit daemon starting");

    let source = Arc::new(
        ConfigSource::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?,
    );
    let config = source.current();

    if let Some(dir) = config.state.path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
    }
    let store = StateStore::open_or_reset(&config.state.path)?;
    info!(path = ?config.state.path, "state store opened");

    let services = Services::from_config(&config)?;
    let running = daemon::spawn(store, source, services)?;

    shutdown_signal().await;
    info!("shutdown signal received");
    running.shutdown().await;

    info!("conduit daemon stopped");
    Ok(())
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
