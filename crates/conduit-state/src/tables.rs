//! redb table definitions for the Conduit state store.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types), except the geo cache which stores the country string directly.

use redb::TableDefinition;

/// Cumulative per-country byte counters keyed by `{country}`.
pub const COUNTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("country_counters");

/// Resolved countries keyed by `{ip}`. Append-only.
pub const GEO_CACHE: TableDefinition<&str, &str> = TableDefinition::new("geo_cache");

/// Report schedules keyed by `{kind}`.
pub const SCHEDULES: TableDefinition<&str, &[u8]> = TableDefinition::new("report_schedules");

/// Watchdog health records keyed by `{target_id}`.
pub const HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("health_records");

/// Fleet snapshots keyed by `latest`.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("fleet_snapshots");

/// Pending immediate alerts keyed by `{raised_at:020}:{condition}`.
pub const OUTBOX: TableDefinition<&str, &[u8]> = TableDefinition::new("alert_outbox");

/// Live peer summaries keyed by `{country}`.
pub const PEERS: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_summaries");
