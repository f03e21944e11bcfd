//! conduit-notify — restart-safe reports and alert delivery.
//!
//! The scheduler never talks to the other loops directly. It reads the
//! latest fleet snapshot, country counters, peer summaries and health
//! records from the state store, renders reports from them, and drains the
//! alert outbox the watchdog fills.
//!
//! Report timing lives entirely in persisted [`ReportSchedule`] rows and
//! the pure [`is_due`] check, so a restart neither repeats nor skips a
//! report beyond what at-least-once delivery implies.
//!
//! [`ReportSchedule`]: conduit_state::ReportSchedule

pub mod channel;
pub mod error;
pub mod report;
pub mod schedule;
pub mod scheduler;

pub use channel::{
    AlertChannel, DEFAULT_SEND_TIMEOUT, LogChannel, TelegramChannel, WebhookChannel,
    channel_from_config,
};
pub use error::{ChannelError, NotifyError, NotifyResult};
pub use report::{ReportData, format_bytes, format_timestamp, render};
pub use schedule::{DAY_SECS, WEEK_SECS, is_due, is_due_within, reconcile};
pub use scheduler::{Scheduler, TickReport};
