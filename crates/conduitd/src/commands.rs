//! One-shot subcommands.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use conduit_core::{ConfigSource, FleetConfig, SystemClock};
use conduit_notify::format_bytes;
use conduit_state::{CountryCounter, PeerSummary, StateStore};
use conduit_status::{FleetCollection, FleetCollector};

use crate::daemon::docker_control;

pub fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    FleetConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Query every worker once and print the result.
pub async fn status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let collector = FleetCollector::new(docker_control(&config), Arc::new(SystemClock))?
        .with_limits(config.fleet.max_in_flight, config.fleet.log_tail_lines);
    let collection = collector
        .collect_detailed(&config.worker_handles(), config.query_timeout())
        .await;
    println!("{}", format_status(&collection));
    Ok(())
}

/// Print persisted country counters and live peers.
///
/// Needs the daemon stopped: it holds the state file lock while running.
pub fn countries(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let counters = store.load_counters()?;
    let peers = store.load_peers()?;
    println!("{}", format_countries(&counters, &peers));
    Ok(())
}

/// Clear country counters and the peer table. The geo cache is kept.
///
/// Needs the daemon stopped, like [`countries`].
pub fn reset_counters(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    store.reset_counters()?;
    println!("Country counters reset.");
    Ok(())
}

/// Validate the file and print the effective configuration.
pub fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let source = ConfigSource::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let config = source.current();
    println!("# {} is valid; effective configuration:\n", config_path.display());
    println!("{}", config.to_toml_string()?);
    Ok(())
}

fn open_store(config: &FleetConfig) -> anyhow::Result<StateStore> {
    StateStore::open(&config.state.path).with_context(|| {
        format!(
            "opening {} (is the daemon running?)",
            config.state.path.display()
        )
    })
}

pub fn format_status(collection: &FleetCollection) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<12} {:>10} {:>10} {:>10} {:>10}",
        "WORKER", "NAME", "CONNECTED", "CONNECTING", "UP", "DOWN"
    );
    for worker in &collection.workers {
        match &worker.result {
            Ok(s) => {
                let _ = writeln!(
                    out,
                    "{:<16} {:<12} {:>10} {:>10} {:>10} {:>10}",
                    worker.worker_id,
                    worker.display_name,
                    s.connected,
                    s.connecting,
                    format_bytes(s.upload_bytes),
                    format_bytes(s.download_bytes)
                );
            }
            Err(e) => {
                let _ = writeln!(
                    out,
                    "{:<16} {:<12} {}",
                    worker.worker_id, worker.display_name, e
                );
            }
        }
    }
    let s = &collection.snapshot;
    let _ = write!(
        out,
        "\n{}/{} running, {} connected, {} connecting, {} up, {} down",
        s.running_count,
        s.total_count,
        s.connected,
        s.connecting,
        format_bytes(s.upload_bytes),
        format_bytes(s.download_bytes)
    );
    out
}

pub fn format_countries(counters: &[CountryCounter], peers: &[PeerSummary]) -> String {
    let mut out = String::new();
    if counters.is_empty() {
        out.push_str("No traffic recorded yet.\n");
    } else {
        let mut sorted: Vec<&CountryCounter> = counters.iter().collect();
        sorted.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.country.cmp(&b.country)));
        let _ = writeln!(out, "{:<24} {:>10} {:>10} {:>10}", "COUNTRY", "IN", "OUT", "TOTAL");
        for c in sorted {
            let _ = writeln!(
                out,
                "{:<24} {:>10} {:>10} {:>10}",
                c.country,
                format_bytes(c.bytes_in),
                format_bytes(c.bytes_out),
                format_bytes(c.total())
            );
        }
    }

    if !peers.is_empty() {
        let _ = writeln!(
            out,
            "\n{:<24} {:>6} {:>10} {:>12}",
            "LIVE PEERS", "PEERS", "BYTES", "RATE"
        );
        for p in peers {
            let _ = writeln!(
                out,
                "{:<24} {:>6} {:>10} {:>12}",
                p.country,
                p.active_peers,
                format_bytes(p.bytes),
                format!("{}/s", format_bytes(p.rate_bps))
            );
        }
    }
    out.trim_end().to_string()
}
