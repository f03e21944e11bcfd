//! Report timing.
//!
//! [`is_due`] is a pure function of the persisted schedule and the current
//! time. Daily and weekly reports fire once a full interval has passed
//! since the last dispatch. Periodic reports additionally wait for a slot:
//! slots start at `phase_offset_seconds` after midnight UTC and repeat
//! every `interval_seconds` through the day, and a report may only go out
//! within the grace window after a slot start.

use std::time::Duration;

use conduit_core::FleetConfig;
use conduit_state::{ReportKind, ReportSchedule};

pub const DAY_SECS: u64 = 86_400;
pub const WEEK_SECS: u64 = 7 * DAY_SECS;

/// Grace window after a periodic slot when none is configured.
pub const DEFAULT_PERIODIC_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Whether `schedule` should fire at `now`, using the default window.
pub fn is_due(schedule: &ReportSchedule, now: u64) -> bool {
    is_due_within(schedule, now, DEFAULT_PERIODIC_WINDOW)
}

/// Whether `schedule` should fire at `now`.
///
/// `window` only applies to periodic reports and is capped at the
/// interval so every time of day is reachable.
pub fn is_due_within(schedule: &ReportSchedule, now: u64, window: Duration) -> bool {
    let interval = schedule.interval_seconds.max(1);
    if now.saturating_sub(schedule.last_fired_at) < interval {
        return false;
    }
    match schedule.kind {
        ReportKind::Periodic => {
            let window = window.as_secs().clamp(1, interval);
            since_slot(now, schedule.phase_offset_seconds, interval) < window
        }
        ReportKind::Daily | ReportKind::Weekly => true,
    }
}

/// Seconds elapsed since the most recent periodic slot start.
///
/// Slots restart at the phase offset every day, so with an interval that
/// does not divide 24h the last slot of the day is shortened.
pub fn since_slot(now: u64, phase: u64, interval: u64) -> u64 {
    let time_of_day = (now % DAY_SECS) as i64;
    let offset = (time_of_day - (phase % DAY_SECS) as i64).rem_euclid(DAY_SECS as i64) as u64;
    offset % interval.max(1)
}

/// Interval of each report kind under `config`.
pub fn interval_for(kind: ReportKind, config: &FleetConfig) -> u64 {
    match kind {
        ReportKind::Periodic => config.periodic_interval().as_secs(),
        ReportKind::Daily => DAY_SECS,
        ReportKind::Weekly => WEEK_SECS,
    }
}

/// Whether `kind` is switched on in `config`.
pub fn is_enabled(kind: ReportKind, config: &FleetConfig) -> bool {
    match kind {
        ReportKind::Periodic => true,
        ReportKind::Daily => config.notify.daily,
        ReportKind::Weekly => config.notify.weekly,
    }
}

/// Bring a schedule in line with `config`, creating it if absent.
///
/// A new periodic schedule has never fired, so it goes out at the next
/// slot; new daily and weekly schedules start counting from `now`. An
/// existing schedule keeps its `last_fired_at` and picks up changed
/// interval or phase.
pub fn reconcile(
    kind: ReportKind,
    existing: Option<ReportSchedule>,
    config: &FleetConfig,
    now: u64,
) -> ReportSchedule {
    let interval_seconds = interval_for(kind, config);
    let phase_offset_seconds = match kind {
        ReportKind::Periodic => config.periodic_phase().as_secs(),
        ReportKind::Daily | ReportKind::Weekly => 0,
    };
    match existing {
        Some(mut schedule) => {
            schedule.interval_seconds = interval_seconds;
            schedule.phase_offset_seconds = phase_offset_seconds;
            schedule
        }
        None => ReportSchedule {
            kind,
            interval_seconds,
            phase_offset_seconds,
            last_fired_at: match kind {
                ReportKind::Periodic => 0,
                ReportKind::Daily | ReportKind::Weekly => now,
            },
        },
    }
}
