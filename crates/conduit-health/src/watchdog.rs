//! The watchdog sweep.
//!
//! Each sweep probes every target concurrently under one deadline, feeds
//! the result through the target's [`HealthTracker`] and acts on the
//! verdict: restart on the first failure, alert once when the target goes
//! down, alert once when it comes back. Alerts go to the outbox table in
//! the state store; the notification scheduler delivers them.
//!
//! Restarts pass through a cool-down ledger keyed by target ID. The ledger
//! is seeded from the persisted `last_recovery_action` of every record, and
//! checking and stamping it happen under one lock, so overlapping sweeps
//! (or a sweep right after a daemon restart) cannot restart a target twice
//! within the cool-down.
//!
//! A restart runs as its own task. The sweep waits for it up to
//! `probe_timeout`; one still running after that is reported as
//! [`TargetOutcome::Restarted`] and left to finish in the background, where
//! the next sweep collects its result.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use conduit_core::{Clock, ConfigSource, FleetConfig, WorkerControl};
use conduit_state::{HealthRecord, HealthState, PendingAlert, StateStore};

use crate::checker::{HealthTracker, ProbeResult, Verdict};
use crate::error::{HealthError, HealthResult};
use crate::resources::ResourceGuard;
use crate::target::{MonitoredTarget, targets_from_config};

/// Tunables for one sweep, taken from the config each cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogSettings {
    pub failure_threshold: u32,
    pub restart_cooldown: Duration,
    pub probe_timeout: Duration,
    pub cpu_threshold_percent: f32,
    pub memory_threshold_percent: f32,
    pub alert_on_recovery: bool,
}

impl WatchdogSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            failure_threshold: config.watchdog.failure_threshold,
            restart_cooldown: config.restart_cooldown(),
            probe_timeout: config.probe_timeout(),
            cpu_threshold_percent: config.watchdog.cpu_threshold_percent,
            memory_threshold_percent: config.watchdog.memory_threshold_percent,
            alert_on_recovery: config.watchdog.alert_on_recovery,
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from_config(&FleetConfig::default())
    }
}

/// What a sweep did with one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Healthy,
    Restarted,
    RestartFailed(String),
    /// A restart was due but the cool-down blocked it.
    Suppressed,
    Degraded,
    WentDown,
    StillDown,
    Recovered { from: HealthState },
    /// Probe or bookkeeping failed; retried next sweep.
    Error(String),
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// `(target_id, outcome)` in target order.
    pub targets: Vec<(String, TargetOutcome)>,
    pub alerts_raised: usize,
}

impl SweepReport {
    pub fn outcome(&self, target_id: &str) -> Option<&TargetOutcome> {
        self.targets
            .iter()
            .find(|(id, _)| id == target_id)
            .map(|(_, outcome)| outcome)
    }
}

pub struct Watchdog {
    store: StateStore,
    clock: Arc<dyn Clock>,
    /// target_id → unix time of the last restart attempt.
    cooldowns: Mutex<HashMap<String, u64>>,
    /// Restarts that outlived their sweep, by target ID.
    in_flight: Mutex<Vec<(String, JoinHandle<HealthResult<()>>)>>,
    resources: Option<Mutex<ResourceGuard>>,
}

impl Watchdog {
    /// Build a watchdog, seeding the cool-down ledger from the store.
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> HealthResult<Self> {
        let cooldowns: HashMap<String, u64> = store
            .list_health()?
            .into_iter()
            .filter_map(|r| r.last_recovery_action.map(|at| (r.target_id, at)))
            .collect();
        debug!(seeded = cooldowns.len(), "restart cool-down ledger loaded");
        Ok(Self {
            store,
            clock,
            cooldowns: Mutex::new(cooldowns),
            in_flight: Mutex::new(Vec::new()),
            resources: None,
        })
    }

    pub fn with_resource_guard(mut self, guard: ResourceGuard) -> Self {
        self.resources = Some(Mutex::new(guard));
        self
    }

    /// Probe every target, act on the verdicts and check host resources.
    pub async fn sweep(
        self: &Arc<Self>,
        targets: &[Arc<dyn MonitoredTarget>],
        settings: WatchdogSettings,
    ) -> SweepReport {
        self.reap_restarts().await;
        let deadline = Instant::now() + settings.probe_timeout;
        let mut set = JoinSet::new();

        for (index, target) in targets.iter().enumerate() {
            let target = Arc::clone(target);
            let watchdog = Arc::clone(self);
            set.spawn(async move {
                let probe = match tokio::time::timeout_at(
                    deadline,
                    target.probe(settings.probe_timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => ProbeResult::Failed,
                };
                let outcome = match watchdog.evaluate(&target, probe, settings).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(target_id = %target.id(), error = %e, "health bookkeeping failed");
                        TargetOutcome::Error(e.to_string())
                    }
                };
                (index, target.id().to_string(), outcome)
            });
        }

        let mut results = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "watchdog probe task failed"),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut report = SweepReport {
            alerts_raised: results
                .iter()
                .filter(|(_, _, o)| {
                    matches!(o, TargetOutcome::WentDown)
                        || (settings.alert_on_recovery
                            && matches!(o, TargetOutcome::Recovered { from: HealthState::Down }))
                })
                .count(),
            targets: results
                .into_iter()
                .map(|(_, id, outcome)| (id, outcome))
                .collect(),
        };
        report.alerts_raised += self.check_resources(&settings);

        debug!(
            targets = report.targets.len(),
            alerts = report.alerts_raised,
            "watchdog sweep complete"
        );
        report
    }

    /// Apply one probe result to a target's persisted record.
    async fn evaluate(
        &self,
        target: &Arc<dyn MonitoredTarget>,
        probe: ProbeResult,
        settings: WatchdogSettings,
    ) -> HealthResult<TargetOutcome> {
        let id = target.id();
        let now = self.clock.now_secs();
        let record = self
            .store
            .get_health(id)?
            .unwrap_or_else(|| HealthRecord::new(id));
        let mut tracker = HealthTracker::from_record(record, settings.failure_threshold);

        let outcome = match tracker.record(probe) {
            Verdict::Steady => TargetOutcome::Healthy,
            Verdict::Restart => {
                warn!(target_id = %id, ?probe, "target failed its health check, restarting");
                match self.claim_recovery(
                    tracker.health_record_mut(),
                    settings.restart_cooldown,
                    now,
                ) {
                    Ok(()) => match self.restart(target, settings.probe_timeout).await {
                        Ok(()) => TargetOutcome::Restarted,
                        Err(e) => {
                            warn!(target_id = %id, error = %e, "restart failed");
                            TargetOutcome::RestartFailed(e.to_string())
                        }
                    },
                    Err(HealthError::CoolingDown { elapsed_secs, .. }) => {
                        info!(target_id = %id, elapsed_secs, "restart skipped, cooling down");
                        TargetOutcome::Suppressed
                    }
                    Err(e) => {
                        warn!(target_id = %id, error = %e, "restart failed");
                        TargetOutcome::RestartFailed(e.to_string())
                    }
                }
            }
            Verdict::StillDegraded => {
                warn!(
                    target_id = %id,
                    failures = tracker.consecutive_failures(),
                    threshold = settings.failure_threshold,
                    "target still failing"
                );
                TargetOutcome::Degraded
            }
            Verdict::WentDown => {
                let failures = tracker.consecutive_failures();
                self.store.enqueue_alert(&PendingAlert {
                    condition: format!("target:{id}:down"),
                    message: format!(
                        "{id} is DOWN after {failures} consecutive failed checks. \
                         Automatic restarts are stopped; manual intervention required."
                    ),
                    raised_at: now,
                })?;
                tracker.health_record_mut().last_alert_sent_at = Some(now);
                TargetOutcome::WentDown
            }
            Verdict::StayDown => TargetOutcome::StillDown,
            Verdict::Recovered { from } => {
                if from == HealthState::Down && settings.alert_on_recovery {
                    self.store.enqueue_alert(&PendingAlert {
                        condition: format!("target:{id}:recovered"),
                        message: format!("{id} has recovered and is healthy again."),
                        raised_at: now,
                    })?;
                    tracker.health_record_mut().last_alert_sent_at = Some(now);
                }
                info!(target_id = %id, %from, "target healthy again");
                TargetOutcome::Recovered { from }
            }
        };

        self.store.put_health(tracker.health_record())?;
        Ok(outcome)
    }

    /// Reserve a restart unless the target is down or was restarted within
    /// `cooldown`. Stamps the ledger and `record` on success.
    pub fn claim_recovery(
        &self,
        record: &mut HealthRecord,
        cooldown: Duration,
        now: u64,
    ) -> HealthResult<()> {
        if record.state == HealthState::Down {
            return Err(HealthError::TargetDown {
                target_id: record.target_id.clone(),
            });
        }
        {
            let mut ledger = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(&last) = ledger.get(&record.target_id) {
                let elapsed_secs = now.saturating_sub(last);
                if elapsed_secs < cooldown.as_secs() {
                    return Err(HealthError::CoolingDown {
                        target_id: record.target_id.clone(),
                        elapsed_secs,
                    });
                }
            }
            ledger.insert(record.target_id.clone(), now);
        }
        record.last_recovery_action = Some(now);
        Ok(())
    }

    /// Spawn `target.recover()` and wait up to `wait` for it. A restart
    /// still running after that counts as issued and moves to `in_flight`.
    async fn restart(&self, target: &Arc<dyn MonitoredTarget>, wait: Duration) -> HealthResult<()> {
        let owned = Arc::clone(target);
        let mut handle = tokio::spawn(async move { owned.recover().await });
        match tokio::time::timeout(wait, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(HealthError::RestartTask(e.to_string())),
            Err(_) => {
                info!(target_id = %target.id(), ?wait, "restart still running, continuing in background");
                self.in_flight
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push((target.id().to_string(), handle));
                Ok(())
            }
        }
    }

    /// Log the result of background restarts that have finished.
    async fn reap_restarts(&self) {
        let finished: Vec<(String, JoinHandle<HealthResult<()>>)> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            let (done, running): (Vec<_>, Vec<_>) =
                in_flight.drain(..).partition(|(_, h)| h.is_finished());
            *in_flight = running;
            done
        };
        for (id, handle) in finished {
            match handle.await {
                Ok(Ok(())) => info!(target_id = %id, "background restart completed"),
                Ok(Err(e)) => warn!(target_id = %id, error = %e, "background restart failed"),
                Err(e) => warn!(target_id = %id, error = %e, "background restart task failed"),
            }
        }
    }

    /// Number of restarts still running from earlier sweeps.
    pub fn restarts_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Delete health records of targets no longer configured.
    pub fn prune_stale(&self, live: &[&str]) -> HealthResult<usize> {
        let live: HashSet<&str> = live.iter().copied().collect();
        let mut removed = 0;
        for record in self.store.list_health()? {
            if !live.contains(record.target_id.as_str()) && self.store.delete_health(&record.target_id)? {
                debug!(target_id = %record.target_id, "removed stale health record");
                removed += 1;
            }
        }
        if removed > 0 {
            let mut ledger = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
            ledger.retain(|id, _| live.contains(id.as_str()));
        }
        Ok(removed)
    }

    /// Sample host resources and enqueue alerts for new threshold
    /// crossings. A crossing whose alert could not be enqueued is raised
    /// again next sweep. Returns the number of alerts raised.
    fn check_resources(&self, settings: &WatchdogSettings) -> usize {
        let Some(guard) = &self.resources else {
            return 0;
        };
        let now = self.clock.now_secs();
        let mut guard = guard.lock().unwrap_or_else(|p| p.into_inner());
        let alerts = guard.check(
            settings.cpu_threshold_percent,
            settings.memory_threshold_percent,
            now,
        );
        let mut raised = 0;
        for alert in &alerts {
            match self.store.enqueue_alert(alert) {
                Ok(()) => {
                    guard.confirm(alert);
                    raised += 1;
                }
                Err(e) => error!(
                    condition = %alert.condition,
                    error = %e,
                    "failed to enqueue alert, retrying next sweep"
                ),
            }
        }
        raised
    }

    /// Sweep on the configured interval until shutdown.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<ConfigSource>,
        control: Arc<dyn WorkerControl>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("health watchdog started");
        loop {
            let config = source.refresh();
            let settings = WatchdogSettings::from_config(&config);
            let targets = targets_from_config(&config, &control);

            let swept = tokio::select! {
                report = self.sweep(&targets, settings) => Some(report),
                _ = shutdown.changed() => None,
            };
            let Some(report) = swept else { break };
            for (id, outcome) in &report.targets {
                if !matches!(outcome, TargetOutcome::Healthy) {
                    debug!(target_id = %id, ?outcome, "target outcome");
                }
            }

            let ids: Vec<&str> = targets.iter().map(|t| t.id()).collect();
            if let Err(e) = self.prune_stale(&ids) {
                warn!(error = %e, "failed to prune stale health records");
            }

            tokio::select! {
                _ = tokio::time::sleep(config.probe_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        let in_flight: Vec<_> = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for (id, handle) in in_flight {
            warn!(target_id = %id, "abandoning restart still in progress");
            handle.abort();
        }
        info!("health watchdog shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use conduit_core::{BoxFuture, ManualClock};

    use crate::resources::tests::ScriptedProbe;

    /// Target with a switchable health and a restart counter.
    struct StubTarget {
        id: String,
        healthy: AtomicBool,
        restarts: AtomicUsize,
        probe_delay: Duration,
        recover_delay: Duration,
    }

    impl StubTarget {
        fn new(id: &str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                healthy: AtomicBool::new(healthy),
                restarts: AtomicUsize::new(0),
                probe_delay: Duration::ZERO,
                recover_delay: Duration::ZERO,
            })
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn restarts(&self) -> usize {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    impl MonitoredTarget for StubTarget {
        fn id(&self) -> &str {
            &self.id
        }

        fn probe<'a>(&'a self, _timeout: Duration) -> BoxFuture<'a, ProbeResult> {
            Box::pin(async move {
                tokio::time::sleep(self.probe_delay).await;
                if self.healthy.load(Ordering::SeqCst) {
                    ProbeResult::Healthy
                } else {
                    ProbeResult::Unhealthy
                }
            })
        }

        fn recover<'a>(&'a self) -> BoxFuture<'a, HealthResult<()>> {
            Box::pin(async move {
                self.restarts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.recover_delay).await;
                Ok(())
            })
        }
    }

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            failure_threshold: 3,
            restart_cooldown: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            alert_on_recovery: true,
        }
    }

    fn setup() -> (Arc<Watchdog>, StateStore, Arc<ManualClock>) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let watchdog = Arc::new(Watchdog::new(store.clone(), clock.clone()).unwrap());
        (watchdog, store, clock)
    }

    fn as_targets(target: &Arc<StubTarget>) -> Vec<Arc<dyn MonitoredTarget>> {
        vec![Arc::clone(target) as Arc<dyn MonitoredTarget>]
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_escalate_to_down_with_one_restart_and_one_alert() {
        let (watchdog, store, clock) = setup();
        let target = StubTarget::new("conduit-2", false);
        let targets = as_targets(&target);

        let expected = [
            (TargetOutcome::Restarted, HealthState::Degraded),
            (TargetOutcome::Degraded, HealthState::Degraded),
            (TargetOutcome::WentDown, HealthState::Down),
        ];
        for (outcome, state) in expected {
            let report = watchdog.sweep(&targets, settings()).await;
            assert_eq!(report.outcome("conduit-2"), Some(&outcome));
            assert_eq!(store.get_health("conduit-2").unwrap().unwrap().state, state);
            clock.advance(60);
        }

        assert_eq!(target.restarts(), 1);
        let alerts = store.pending_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].condition, "target:conduit-2:down");
        assert!(alerts[0].message.contains("manual intervention"));

        // Further failures: no restarts, no new alerts.
        for _ in 0..5 {
            let report = watchdog.sweep(&targets, settings()).await;
            assert_eq!(report.outcome("conduit-2"), Some(&TargetOutcome::StillDown));
            clock.advance(600);
        }
        assert_eq!(target.restarts(), 1);
        assert_eq!(store.pending_alerts().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_from_down_resets_and_alerts_once() {
        let (watchdog, store, clock) = setup();
        let target = StubTarget::new("docker", false);
        let targets = as_targets(&target);
        for _ in 0..3 {
            watchdog.sweep(&targets, settings()).await;
            clock.advance(60);
        }

        target.set_healthy(true);
        let report = watchdog.sweep(&targets, settings()).await;
        assert_eq!(
            report.outcome("docker"),
            Some(&TargetOutcome::Recovered { from: HealthState::Down })
        );
        let record = store.get_health("docker").unwrap().unwrap();
        assert_eq!(record.state, HealthState::Healthy);
        assert_eq!(record.consecutive_failures, 0);

        let conditions: Vec<String> = store
            .pending_alerts()
            .unwrap()
            .into_iter()
            .map(|a| a.condition)
            .collect();
        assert_eq!(conditions, vec!["target:docker:down", "target:docker:recovered"]);

        let report = watchdog.sweep(&targets, settings()).await;
        assert_eq!(report.outcome("docker"), Some(&TargetOutcome::Healthy));
        assert_eq!(store.pending_alerts().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_alert_can_be_disabled() {
        let (watchdog, store, clock) = setup();
        let target = StubTarget::new("docker", false);
        let targets = as_targets(&target);
        let quiet = WatchdogSettings {
            alert_on_recovery: false,
            ..settings()
        };
        for _ in 0..3 {
            watchdog.sweep(&targets, quiet).await;
            clock.advance(60);
        }
        target.set_healthy(true);
        watchdog.sweep(&targets, quiet).await;
        assert_eq!(store.pending_alerts().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_within_cooldown_does_not_restart() {
        let (watchdog, _store, clock) = setup();
        let target = StubTarget::new("conduit", false);
        let targets = as_targets(&target);

        watchdog.sweep(&targets, settings()).await;
        assert_eq!(target.restarts(), 1);

        target.set_healthy(true);
        clock.advance(60);
        watchdog.sweep(&targets, settings()).await;

        target.set_healthy(false);
        clock.advance(60);
        let report = watchdog.sweep(&targets, settings()).await;
        assert_eq!(report.outcome("conduit"), Some(&TargetOutcome::Suppressed));
        assert_eq!(target.restarts(), 1);

        // Past the cool-down a new first failure restarts again.
        target.set_healthy(true);
        clock.advance(300);
        watchdog.sweep(&targets, settings()).await;
        target.set_healthy(false);
        let report = watchdog.sweep(&targets, settings()).await;
        assert_eq!(report.outcome("conduit"), Some(&TargetOutcome::Restarted));
        assert_eq!(target.restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sweeps_restart_once() {
        let (watchdog, _store, _clock) = setup();
        let target = Arc::new(StubTarget {
            id: "conduit-3".into(),
            healthy: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
            probe_delay: Duration::from_millis(100),
            recover_delay: Duration::ZERO,
        });
        let targets = as_targets(&target);

        let (a, b) = tokio::join!(
            watchdog.sweep(&targets, settings()),
            watchdog.sweep(&targets, settings())
        );
        assert_eq!(target.restarts(), 1);
        let outcomes = [a.outcome("conduit-3").cloned(), b.outcome("conduit-3").cloned()];
        assert!(outcomes.contains(&Some(TargetOutcome::Restarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_survives_daemon_restart() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let mut record = HealthRecord::new("conduit");
        record.last_recovery_action = Some(9_900);
        store.put_health(&record).unwrap();

        let watchdog = Arc::new(Watchdog::new(store.clone(), clock).unwrap());
        let target = StubTarget::new("conduit", false);
        let report = watchdog.sweep(&as_targets(&target), settings()).await;
        assert_eq!(report.outcome("conduit"), Some(&TargetOutcome::Suppressed));
        assert_eq!(target.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_counts_as_failure() {
        let (watchdog, _store, _clock) = setup();
        let target = Arc::new(StubTarget {
            id: "caddy-http".into(),
            healthy: AtomicBool::new(true),
            restarts: AtomicUsize::new(0),
            probe_delay: Duration::from_secs(60),
            recover_delay: Duration::ZERO,
        });
        let started = Instant::now();
        let report = watchdog.sweep(&as_targets(&target), settings()).await;
        assert!(started.elapsed() <= Duration::from_secs(10) + Duration::from_millis(50));
        assert_eq!(report.outcome("caddy-http"), Some(&TargetOutcome::Restarted));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_restart_does_not_hold_up_the_sweep() {
        let (watchdog, store, clock) = setup();
        let stuck = Arc::new(StubTarget {
            id: "conduit-2".into(),
            healthy: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
            probe_delay: Duration::ZERO,
            recover_delay: Duration::from_secs(60),
        });
        let fine = StubTarget::new("conduit", true);
        let targets: Vec<Arc<dyn MonitoredTarget>> = vec![
            stuck.clone() as Arc<dyn MonitoredTarget>,
            fine.clone() as Arc<dyn MonitoredTarget>,
        ];

        let started = Instant::now();
        let report = watchdog.sweep(&targets, settings()).await;
        assert!(started.elapsed() <= Duration::from_secs(10) + Duration::from_millis(50));
        assert_eq!(report.outcome("conduit-2"), Some(&TargetOutcome::Restarted));
        assert_eq!(report.outcome("conduit"), Some(&TargetOutcome::Healthy));
        assert_eq!(stuck.restarts(), 1);
        assert_eq!(watchdog.restarts_in_flight(), 1);
        assert_eq!(
            store.get_health("conduit-2").unwrap().unwrap().last_recovery_action,
            Some(1_000_000)
        );

        // The restart finishes in the background and is collected by the
        // next sweep without being issued again.
        tokio::time::sleep(Duration::from_secs(60)).await;
        stuck.set_healthy(true);
        clock.advance(60);
        let report = watchdog.sweep(&targets, settings()).await;
        assert_eq!(watchdog.restarts_in_flight(), 0);
        assert_eq!(stuck.restarts(), 1);
        assert_eq!(
            report.outcome("conduit-2"),
            Some(&TargetOutcome::Recovered { from: HealthState::Degraded })
        );
    }

    #[test]
    fn down_targets_are_never_recovered_automatically() {
        let (watchdog, _store, _clock) = setup();
        let mut record = HealthRecord::new("conduit");
        record.state = HealthState::Down;
        let err = watchdog
            .claim_recovery(&mut record, Duration::from_secs(300), 1)
            .unwrap_err();
        assert!(matches!(err, HealthError::TargetDown { .. }));
        assert_eq!(record.last_recovery_action, None);
    }

    #[tokio::test]
    async fn stale_records_are_pruned() {
        let (watchdog, store, _clock) = setup();
        store.put_health(&HealthRecord::new("conduit")).unwrap();
        store.put_health(&HealthRecord::new("conduit-5")).unwrap();
        assert_eq!(watchdog.prune_stale(&["conduit", "docker"]).unwrap(), 1);
        let ids: Vec<String> = store
            .list_health()
            .unwrap()
            .into_iter()
            .map(|r| r.target_id)
            .collect();
        assert_eq!(ids, vec!["conduit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resource_breaches_are_enqueued_once() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(50));
        let probe = ScriptedProbe::new(&[(95.0, 20.0), (96.0, 20.0)]);
        let watchdog = Arc::new(
            Watchdog::new(store.clone(), clock)
                .unwrap()
                .with_resource_guard(ResourceGuard::new(Box::new(probe))),
        );

        let first = watchdog.sweep(&[], settings()).await;
        let second = watchdog.sweep(&[], settings()).await;
        assert_eq!(first.alerts_raised, 1);
        assert_eq!(second.alerts_raised, 0);
        let alerts = store.pending_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].condition, "resource:cpu");
    }
}
