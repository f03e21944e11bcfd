//! Report rendering.
//!
//! Reports are plain text built from whatever the other loops last
//! persisted. A missing snapshot or empty table renders as such rather
//! than failing the report.

use std::fmt::Write as _;

use conduit_state::{
    CountryCounter, FleetSnapshot, HealthRecord, HealthState, PeerSummary, ReportKind, StateResult,
    StateStore,
};

/// Everything a report is rendered from.
#[derive(Debug, Clone, Default)]
pub struct ReportData {
    pub snapshot: Option<FleetSnapshot>,
    pub counters: Vec<CountryCounter>,
    pub peers: Vec<PeerSummary>,
    pub health: Vec<HealthRecord>,
}

impl ReportData {
    pub fn load(store: &StateStore) -> StateResult<Self> {
        Ok(Self {
            snapshot: store.latest_snapshot()?,
            counters: store.load_counters()?,
            peers: store.load_peers()?,
            health: store.list_health()?,
        })
    }
}

/// Format a byte count with base-1024 units and one decimal.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Human timestamp for report headers.
pub fn format_timestamp(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn render(kind: ReportKind, data: &ReportData, top_countries: usize, now: u64) -> String {
    let title = match kind {
        ReportKind::Periodic => "Conduit status",
        ReportKind::Daily => "Conduit daily summary",
        ReportKind::Weekly => "Conduit weekly summary",
    };
    let mut out = String::new();
    let _ = writeln!(out, "{title} ({})", format_timestamp(now));
    let _ = writeln!(out);

    match &data.snapshot {
        Some(s) => {
            let _ = writeln!(out, "Workers: {}/{} running", s.running_count, s.total_count);
            let _ = writeln!(out, "Clients: {} connected, {} connecting", s.connected, s.connecting);
            let _ = writeln!(
                out,
                "Traffic: {} up, {} down",
                format_bytes(s.upload_bytes),
                format_bytes(s.download_bytes)
            );
            let _ = writeln!(out, "Sampled: {}", format_timestamp(s.sampled_at));
        }
        None => {
            let _ = writeln!(out, "Workers: no status collected yet");
        }
    }

    if matches!(kind, ReportKind::Daily | ReportKind::Weekly) {
        let _ = writeln!(out);
        render_health(&mut out, &data.health);
    }

    let _ = writeln!(out);
    render_countries(&mut out, &data.counters, top_countries);

    if !data.peers.is_empty() {
        let _ = writeln!(out);
        let total: u32 = data.peers.iter().map(|p| p.active_peers).sum();
        let _ = writeln!(out, "Active peers: {total}");
        for peer in data.peers.iter().take(top_countries) {
            let _ = writeln!(
                out,
                "  {}: {} ({}, {}/s)",
                peer.country,
                peer.active_peers,
                format_bytes(peer.bytes),
                format_bytes(peer.rate_bps)
            );
        }
    }

    out.trim_end().to_string()
}

fn render_countries(out: &mut String, counters: &[CountryCounter], top: usize) {
    if counters.is_empty() {
        let _ = writeln!(out, "Countries: no traffic recorded");
        return;
    }
    let mut sorted: Vec<&CountryCounter> = counters.iter().collect();
    sorted.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.country.cmp(&b.country)));

    let _ = writeln!(out, "Top countries:");
    for (i, c) in sorted.iter().take(top).enumerate() {
        let _ = writeln!(
            out,
            "  {}. {}: {} in, {} out",
            i + 1,
            c.country,
            format_bytes(c.bytes_in),
            format_bytes(c.bytes_out)
        );
    }
    if sorted.len() > top {
        let _ = writeln!(out, "  ... and {} more", sorted.len() - top);
    }
}

fn render_health(out: &mut String, records: &[HealthRecord]) {
    let unhealthy: Vec<&HealthRecord> = records
        .iter()
        .filter(|r| r.state != HealthState::Healthy)
        .collect();
    if unhealthy.is_empty() {
        let _ = writeln!(out, "Health: all {} targets healthy", records.len());
        return;
    }
    let _ = writeln!(out, "Health: {} of {} targets unhealthy", unhealthy.len(), records.len());
    for r in unhealthy {
        let _ = writeln!(
            out,
            "  {}: {} ({} consecutive failures)",
            r.target_id, r.state, r.consecutive_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024u64.pow(4)), "3.0 TB");
    }

    #[test]
    fn timestamp_is_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00 UTC");
    }

    fn sample() -> ReportData {
        ReportData {
            snapshot: Some(FleetSnapshot {
                running_count: 2,
                total_count: 3,
                connecting: 4,
                connected: 15,
                upload_bytes: 2048,
                download_bytes: 1024 * 1024,
                sampled_at: 0,
            }),
            counters: vec![
                CountryCounter {
                    country: "Iran".into(),
                    bytes_in: 4096,
                    bytes_out: 0,
                },
                CountryCounter {
                    country: "Germany".into(),
                    bytes_in: 1000,
                    bytes_out: 0,
                },
                CountryCounter {
                    country: "Russia".into(),
                    bytes_in: 2048,
                    bytes_out: 2048,
                },
            ],
            peers: vec![PeerSummary {
                country: "Iran".into(),
                active_peers: 7,
                bytes: 4096,
                rate_bps: 1536,
            }],
            health: vec![
                HealthRecord::new("conduit"),
                HealthRecord {
                    state: HealthState::Down,
                    consecutive_failures: 3,
                    ..HealthRecord::new("conduit-2")
                },
            ],
        }
    }

    #[test]
    fn periodic_report_lists_fleet_and_top_countries() {
        let text = render(ReportKind::Periodic, &sample(), 2, 0);
        assert!(text.starts_with("Conduit status (1970-01-01 00:00 UTC)"));
        assert!(text.contains("Workers: 2/3 running"));
        assert!(text.contains("Clients: 15 connected, 4 connecting"));
        assert!(text.contains("Traffic: 2.0 KB up, 1.0 MB down"));

        let iran = text.find("1. Iran").unwrap();
        let russia = text.find("2. Russia").unwrap();
        assert!(iran < russia);
        assert!(!text.contains("Germany"));
        assert!(text.contains("... and 1 more"));
        assert!(text.contains("Active peers: 7"));
        assert!(text.contains("  Iran: 7 (4.0 KB, 1.5 KB/s)"));
        assert!(!text.contains("Health:"));
    }

    #[test]
    fn daily_report_includes_health() {
        let text = render(ReportKind::Daily, &sample(), 10, 0);
        assert!(text.contains("Health: 1 of 2 targets unhealthy"));
        assert!(text.contains("conduit-2: down (3 consecutive failures)"));
    }

    #[test]
    fn empty_state_still_renders() {
        let text = render(ReportKind::Weekly, &ReportData::default(), 10, 0);
        assert!(text.contains("no status collected yet"));
        assert!(text.contains("Health: all 0 targets healthy"));
        assert!(text.contains("no traffic recorded"));
    }
}
