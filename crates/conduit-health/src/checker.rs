//! Per-target escalation.
//!
//! [`HealthTracker`] folds probe results into a [`HealthRecord`] and answers
//! with a [`Verdict`]. It does no I/O; the watchdog acts on the verdict.

use tracing::{debug, warn};

use conduit_state::{HealthRecord, HealthState};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered as healthy.
    Healthy,
    /// The target answered but is not healthy (stopped, error status, inactive).
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// What the watchdog should do after a probe has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Healthy and was healthy.
    Steady,
    /// First failure: attempt an in-place restart.
    Restart,
    /// Failing below the threshold; a restart was already attempted.
    StillDegraded,
    /// Threshold reached on this probe: stop restarting, alert.
    WentDown,
    /// Already down and still failing.
    StayDown,
    /// Healthy again after failures.
    Recovered { from: HealthState },
}

/// Tracks consecutive probe results for a single target.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    record: HealthRecord,
    /// Consecutive failures before the target is declared down.
    failure_threshold: u32,
}

impl HealthTracker {
    /// Continue from a persisted record.
    pub fn from_record(record: HealthRecord, failure_threshold: u32) -> Self {
        Self {
            record,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn new(target_id: &str, failure_threshold: u32) -> Self {
        Self::from_record(HealthRecord::new(target_id), failure_threshold)
    }

    /// Record a probe result and return the resulting verdict.
    pub fn record(&mut self, result: ProbeResult) -> Verdict {
        if result.is_healthy() {
            let from = self.record.state;
            if from == HealthState::Healthy && self.record.consecutive_failures == 0 {
                return Verdict::Steady;
            }
            self.record.consecutive_failures = 0;
            self.record.state = HealthState::Healthy;
            debug!(target_id = %self.record.target_id, %from, "target recovered to healthy");
            return Verdict::Recovered { from };
        }

        self.record.consecutive_failures = self.record.consecutive_failures.saturating_add(1);
        if self.record.state == HealthState::Down {
            return Verdict::StayDown;
        }
        if self.record.consecutive_failures >= self.failure_threshold {
            warn!(
                target_id = %self.record.target_id,
                failures = self.record.consecutive_failures,
                threshold = self.failure_threshold,
                "target marked down"
            );
            self.record.state = HealthState::Down;
            return Verdict::WentDown;
        }
        self.record.state = HealthState::Degraded;
        if self.record.consecutive_failures == 1 {
            Verdict::Restart
        } else {
            Verdict::StillDegraded
        }
    }

    pub fn state(&self) -> HealthState {
        self.record.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.record.consecutive_failures
    }

    pub fn health_record(&self) -> &HealthRecord {
        &self.record
    }

    pub fn health_record_mut(&mut self) -> &mut HealthRecord {
        &mut self.record
    }

    pub fn into_record(self) -> HealthRecord {
        self.record
    }
}
