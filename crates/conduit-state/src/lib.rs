//! conduit-state — embedded state store for the Conduit fleet.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for country counters, the geo cache, fleet snapshots, health
//! records, report schedules and the alert outbox.
//!
//! # Architecture
//!
//! The independent loops of the daemon never share memory; they hand off
//! through this store. Each table has a single writer:
//!
//! ```text
//! tracker   → country_counters, geo_cache, peer_summaries
//! collector → fleet_snapshots
//! watchdog  → health_records, alert_outbox (insert)
//! notifier  → report_schedules, alert_outbox (delete)
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, TrafficBatch};
pub use types::*;
