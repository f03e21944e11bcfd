//! conduitd — the Conduit fleet daemon.
//!
//! Assembles the four periodic loops over one state store:
//! - Traffic tracker (per-country counters, live peers)
//! - Fleet status aggregator (latest snapshot)
//! - Health watchdog (probes, restarts, alerts)
//! - Notification scheduler (reports, outbox)
//!
//! [`daemon::spawn`] is the wiring shared by the binary and the
//! integration tests; the binary only adds the CLI and signal handling.

pub mod commands;
pub mod daemon;
