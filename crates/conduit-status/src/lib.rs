//! conduit-status — fleet-wide status from concurrently polled workers.
//!
//! [`FleetCollector`] fans out one bounded query per worker, parses each
//! worker's latest status line with the tolerant [`StatusParser`] and sums
//! the valid samples into a [`FleetSnapshot`](conduit_state::FleetSnapshot).

pub mod collector;
pub mod parser;

pub use collector::{FleetCollection, FleetCollector, QueryError, StatusSample, WorkerOutcome};
pub use parser::{ParsedStatus, StatusParser, parse_size, parse_uptime};
