//! conduit-health — health watchdog and self-healing for the Conduit fleet.
//!
//! Supervises every worker, the container runtime and the optional reverse
//! proxy, restarting a failing target once and escalating to an operator
//! alert when it keeps failing.
//!
//! # Architecture
//!
//! ```text
//! Watchdog::run
//!   └── sweep (every probe_interval)
//!       ├── MonitoredTarget::probe ── JoinSet, shared deadline
//!       ├── HealthTracker (Healthy → Degraded → Down → Healthy)
//!       ├── cool-down ledger ── MonitoredTarget::recover
//!       ├── ResourceGuard (CPU / memory crossings)
//!       └── StateStore: health records + alert outbox
//! ```
//!
//! # Escalation
//!
//! The first failed probe restarts the target. Further failures below
//! `failure_threshold` only count. At the threshold the target is marked
//! down, one "manual intervention required" alert is queued and automatic
//! restarts stop until a probe succeeds again.

pub mod checker;
pub mod error;
pub mod http_check;
pub mod resources;
pub mod target;
pub mod watchdog;

pub use checker::{HealthTracker, ProbeResult, Verdict};
pub use error::{HealthError, HealthResult};
pub use http_check::http_probe;
pub use resources::{ResourceGuard, ResourceProbe, ResourceUsage, SysinfoProbe};
pub use target::{HttpServiceTarget, MonitoredTarget, SystemdUnitTarget, WorkerTarget, targets_from_config};
pub use watchdog::{SweepReport, TargetOutcome, Watchdog, WatchdogSettings};
