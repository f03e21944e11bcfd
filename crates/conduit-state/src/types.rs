//! Domain types for the Conduit state store.
//!
//! These types are the durable hand-off between the independent loops:
//! the tracker writes counters and peers, the status collector writes
//! snapshots, the watchdog writes health records and pending alerts, and
//! the notification scheduler writes report schedules.

use serde::{Deserialize, Serialize};

/// Country bucket used for private, loopback and other non-routable peers.
pub const LOCAL_COUNTRY: &str = "LOCAL";

/// Country bucket used when the geo database cannot place an address.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

// ── Traffic ───────────────────────────────────────────────────────

/// Cumulative byte totals for one resolved remote country.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CountryCounter {
    pub country: String,
    /// Bytes received from peers in this country.
    pub bytes_in: u64,
    /// Bytes sent to peers in this country.
    pub bytes_out: u64,
}

impl CountryCounter {
    pub fn new(country: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// Live view of remote peers seen recently, grouped by country.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub country: String,
    /// Peers seen within the peer timeout.
    pub active_peers: u32,
    /// Bytes exchanged with those peers since they were first seen.
    pub bytes: u64,
    /// Combined recent throughput of those peers, bytes per second.
    #[serde(default)]
    pub rate_bps: u64,
}

// ── Fleet ─────────────────────────────────────────────────────────

/// Combined point-in-time view across all workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FleetSnapshot {
    /// Workers whose status query succeeded with parseable data.
    pub running_count: u32,
    /// Workers the fleet configuration expects.
    pub total_count: u32,
    pub connecting: u64,
    pub connected: u64,
    /// Sum of every running worker's cumulative upload counter.
    pub upload_bytes: u64,
    /// Sum of every running worker's cumulative download counter.
    pub download_bytes: u64,
    /// Unix timestamp (seconds) the collection started.
    pub sampled_at: u64,
}

// ── Health ────────────────────────────────────────────────────────

/// Watchdog view of a monitored target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
        };
        f.write_str(s)
    }
}

/// Escalation state of one monitored target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthRecord {
    pub target_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    /// Unix timestamp of the last restart attempt, if any.
    pub last_recovery_action: Option<u64>,
    /// Unix timestamp of the last alert raised for this target, if any.
    pub last_alert_sent_at: Option<u64>,
}

impl HealthRecord {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_recovery_action: None,
            last_alert_sent_at: None,
        }
    }
}

// ── Notifications ─────────────────────────────────────────────────

/// Kind of scheduled report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Periodic,
    Daily,
    Weekly,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [ReportKind::Periodic, ReportKind::Daily, ReportKind::Weekly];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Periodic => "periodic",
            ReportKind::Daily => "daily",
            ReportKind::Weekly => "weekly",
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted timing state of one report kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSchedule {
    pub kind: ReportKind,
    pub interval_seconds: u64,
    /// Seconds after midnight (UTC) the first slot of the day starts.
    pub phase_offset_seconds: u64,
    /// Unix timestamp of the last successful dispatch.
    pub last_fired_at: u64,
}

/// An immediate alert waiting in the outbox for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingAlert {
    /// Condition key, e.g. `target:conduit-2:down` or `resource:cpu`.
    pub condition: String,
    pub message: String,
    pub raised_at: u64,
}

impl PendingAlert {
    /// Build the composite key for the outbox table.
    ///
    /// Zero-padded so lexical order equals raise order.
    pub fn table_key(&self) -> String {
        format!("{:020}:{}", self.raised_at, self.condition)
    }
}
