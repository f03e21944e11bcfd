//! The notification loop.
//!
//! Each tick first drains the alert outbox, then dispatches every report
//! that is due. Sending always happens before the matching state change is
//! persisted (outbox row removed, `last_fired_at` advanced), so a crash or
//! a store error between the two results in a repeat, never a loss.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use conduit_core::{Clock, ConfigSource, FleetConfig};
use conduit_state::{ReportKind, StateStore};

use crate::channel::AlertChannel;
use crate::error::NotifyResult;
use crate::report::{ReportData, render};
use crate::schedule::{is_due_within, is_enabled, reconcile};

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub alerts_sent: usize,
    /// Alerts left in the outbox because delivery failed.
    pub alerts_pending: usize,
    pub reports_sent: Vec<ReportKind>,
    pub reports_failed: Vec<ReportKind>,
}

pub struct Scheduler {
    store: StateStore,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Deliver queued alerts in raise order.
    ///
    /// Stops at the first failed send so ordering is kept; the rest go out
    /// on a later tick.
    pub async fn drain_outbox(&self, channel: &dyn AlertChannel) -> NotifyResult<(usize, usize)> {
        let pending = self.store.pending_alerts()?;
        let mut sent = 0;
        for alert in &pending {
            if let Err(e) = channel.send(&alert.message).await {
                warn!(
                    channel = channel.name(),
                    condition = %alert.condition,
                    error = %e,
                    "alert delivery failed; will retry"
                );
                break;
            }
            self.store.remove_alert(alert)?;
            info!(condition = %alert.condition, "alert sent");
            sent += 1;
        }
        Ok((sent, pending.len() - sent))
    }

    /// Send `kind` if it is due. Returns whether it was sent.
    pub async fn dispatch_if_due(
        &self,
        kind: ReportKind,
        config: &FleetConfig,
        channel: &dyn AlertChannel,
    ) -> NotifyResult<bool> {
        let now = self.clock.now_secs();
        let existing = self.store.get_schedule(kind)?;
        let seeded = existing.is_none();
        let mut schedule = reconcile(kind, existing.clone(), config, now);
        if existing.as_ref() != Some(&schedule) {
            self.store.put_schedule(&schedule)?;
            if seeded {
                debug!(report = %kind, "report schedule created");
            }
        }

        if !is_due_within(&schedule, now, config.periodic_window()) {
            return Ok(false);
        }

        let data = ReportData::load(&self.store)?;
        let message = render(kind, &data, config.notify.top_countries, now);
        channel.send(&message).await?;

        schedule.last_fired_at = now;
        self.store.put_schedule(&schedule)?;
        info!(report = %kind, channel = channel.name(), "report sent");
        Ok(true)
    }

    /// One full pass: outbox, then every enabled report kind.
    pub async fn tick(&self, config: &FleetConfig, channel: &dyn AlertChannel) -> TickReport {
        let mut report = TickReport::default();

        match self.drain_outbox(channel).await {
            Ok((sent, pending)) => {
                report.alerts_sent = sent;
                report.alerts_pending = pending;
            }
            Err(e) => warn!(error = %format!("{e:#}"), "failed to drain alert outbox"),
        }

        for kind in ReportKind::ALL {
            if !is_enabled(kind, config) {
                continue;
            }
            match self.dispatch_if_due(kind, config, channel).await {
                Ok(true) => report.reports_sent.push(kind),
                Ok(false) => {}
                Err(e) => {
                    warn!(report = %kind, error = %format!("{e:#}"), "report dispatch failed");
                    report.reports_failed.push(kind);
                }
            }
        }
        report
    }

    pub async fn run(
        self,
        source: Arc<ConfigSource>,
        channel: Arc<dyn AlertChannel>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(channel = channel.name(), "notification scheduler started");
        loop {
            let config = source.refresh();
            let ticked = tokio::select! {
                r = self.tick(&config, channel.as_ref()) => Some(r),
                _ = shutdown.changed() => None,
            };
            let Some(report) = ticked else { break };
            if report != TickReport::default() {
                debug!(?report, "notification tick");
            }

            tokio::select! {
                _ = tokio::time::sleep(config.tick_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("notification scheduler shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use conduit_core::{BoxFuture, ManualClock};
    use conduit_state::{FleetSnapshot, PendingAlert, ReportSchedule};

    use crate::error::ChannelError;

    const H: u64 = 3_600;
    /// 2026-10-18 00:00:00 UTC.
    const MIDNIGHT: u64 = 1_792_281_600;

    /// Records messages; fails while `failing` is set.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        failing: AtomicBool,
    }

    impl RecordingChannel {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), ChannelError>> {
            Box::pin(async move {
                if self.failing.load(Ordering::SeqCst) {
                    return Err(ChannelError::Status {
                        code: 502,
                        body: "bad gateway".into(),
                    });
                }
                self.sent.lock().unwrap().push(message.to_string());
                Ok(())
            })
        }
    }

    fn periodic_only() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.notify.daily = false;
        config.notify.weekly = false;
        config
    }

    fn setup(now: u64) -> (StateStore, Arc<ManualClock>, Scheduler) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let scheduler = Scheduler::new(store.clone(), clock.clone());
        (store, clock, scheduler)
    }

    fn alert(condition: &str, at: u64) -> PendingAlert {
        PendingAlert {
            condition: condition.into(),
            message: format!("{condition} raised"),
            raised_at: at,
        }
    }

    #[tokio::test]
    async fn overdue_periodic_report_is_sent_once() {
        let now = MIDNIGHT + 12 * H + 300;
        let (store, clock, scheduler) = setup(now);
        store
            .put_schedule(&ReportSchedule {
                kind: ReportKind::Periodic,
                interval_seconds: 6 * H,
                phase_offset_seconds: 0,
                last_fired_at: now - 7 * H,
            })
            .unwrap();
        store
            .put_latest_snapshot(&FleetSnapshot {
                running_count: 1,
                total_count: 1,
                ..Default::default()
            })
            .unwrap();

        let channel = RecordingChannel::default();
        let config = periodic_only();
        let report = scheduler.tick(&config, &channel).await;
        assert_eq!(report.reports_sent, vec![ReportKind::Periodic]);
        assert_eq!(channel.sent().len(), 1);
        assert!(channel.sent()[0].contains("Workers: 1/1 running"));
        let schedule = store.get_schedule(ReportKind::Periodic).unwrap().unwrap();
        assert_eq!(schedule.last_fired_at, now);

        // Same slot, a minute later: nothing more.
        clock.advance(60);
        let report = scheduler.tick(&config, &channel).await;
        assert!(report.reports_sent.is_empty());
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_leaves_schedule_untouched() {
        let now = MIDNIGHT + 6 * H + 60;
        let (store, clock, scheduler) = setup(now);
        let channel = RecordingChannel::default();
        channel.failing.store(true, Ordering::SeqCst);
        let config = periodic_only();

        let report = scheduler.tick(&config, &channel).await;
        assert_eq!(report.reports_failed, vec![ReportKind::Periodic]);
        let schedule = store.get_schedule(ReportKind::Periodic).unwrap().unwrap();
        assert_eq!(schedule.last_fired_at, 0);

        // Channel recovers within the window: the report goes out.
        channel.failing.store(false, Ordering::SeqCst);
        clock.advance(60);
        let report = scheduler.tick(&config, &channel).await;
        assert_eq!(report.reports_sent, vec![ReportKind::Periodic]);
        let schedule = store.get_schedule(ReportKind::Periodic).unwrap().unwrap();
        assert_eq!(schedule.last_fired_at, now + 60);
    }

    #[tokio::test]
    async fn schedules_survive_restart() {
        let now = MIDNIGHT + 6 * H + 60;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let channel = RecordingChannel::default();
        let config = periodic_only();
        {
            let store = StateStore::open(&path).unwrap();
            let scheduler = Scheduler::new(store, Arc::new(ManualClock::new(now)));
            scheduler.tick(&config, &channel).await;
        }
        let store = StateStore::open(&path).unwrap();
        let scheduler = Scheduler::new(store, Arc::new(ManualClock::new(now + 120)));
        let report = scheduler.tick(&config, &channel).await;
        assert!(report.reports_sent.is_empty());
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn daily_and_weekly_wait_a_full_interval_after_seeding() {
        let now = MIDNIGHT + 9 * H;
        let (store, clock, scheduler) = setup(now);
        let channel = RecordingChannel::default();
        let mut config = FleetConfig::default();
        config.notify.periodic_phase = "1h".into();

        let report = scheduler.tick(&config, &channel).await;
        assert!(report.reports_sent.is_empty());
        assert!(store.get_schedule(ReportKind::Daily).unwrap().is_some());
        assert!(store.get_schedule(ReportKind::Weekly).unwrap().is_some());

        clock.advance(24 * H);
        let report = scheduler.tick(&config, &channel).await;
        assert_eq!(report.reports_sent, vec![ReportKind::Daily]);
        assert!(channel.sent()[0].starts_with("Conduit daily summary"));
    }

    #[tokio::test]
    async fn outbox_is_drained_in_order_and_kept_on_failure() {
        let now = MIDNIGHT + 3 * H;
        let (store, _clock, scheduler) = setup(now);
        store.enqueue_alert(&alert("target:conduit-2:down", now - 20)).unwrap();
        store.enqueue_alert(&alert("resource:cpu", now - 10)).unwrap();

        let channel = RecordingChannel::default();
        channel.failing.store(true, Ordering::SeqCst);
        let report = scheduler.tick(&periodic_only(), &channel).await;
        assert_eq!(report.alerts_sent, 0);
        assert_eq!(report.alerts_pending, 2);
        assert_eq!(store.pending_alerts().unwrap().len(), 2);

        channel.failing.store(false, Ordering::SeqCst);
        let report = scheduler.tick(&periodic_only(), &channel).await;
        assert_eq!(report.alerts_sent, 2);
        assert_eq!(
            channel.sent(),
            vec![
                "target:conduit-2:down raised".to_string(),
                "resource:cpu raised".to_string()
            ]
        );
        assert!(store.pending_alerts().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let now = MIDNIGHT + 3 * H;
        let (store, _clock, scheduler) = setup(now);
        store.enqueue_alert(&alert("target:docker:down", now)).unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let source = Arc::new(ConfigSource::fixed(periodic_only()));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(source, channel.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(channel.sent(), vec!["target:docker:down raised".to_string()]);
        assert!(store.pending_alerts().unwrap().is_empty());
    }
}
