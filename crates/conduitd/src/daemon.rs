//! Loop wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use conduit_core::{Clock, ConfigSource, DockerControl, FleetConfig, SystemClock, WorkerControl};
use conduit_health::{ResourceGuard, ResourceProbe, SysinfoProbe, Watchdog};
use conduit_notify::{AlertChannel, Scheduler, channel_from_config};
use conduit_state::StateStore;
use conduit_status::FleetCollector;
use conduit_tracker::{FlowClassifier, GeoIpCommand, GeoLookup, PacketCapture, TcpdumpCapture, Tracker};

/// Budget for one docker invocation; stop and restart include the grace period.
const DOCKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The external bindings the loops drive.
pub struct Services {
    pub control: Arc<dyn WorkerControl>,
    pub capture: Arc<dyn PacketCapture>,
    pub lookup: Arc<dyn GeoLookup>,
    pub classifier: FlowClassifier,
    pub channel: Arc<dyn AlertChannel>,
    pub clock: Arc<dyn Clock>,
    /// Host resource sampling; `None` disables resource alerts.
    pub resources: Option<Box<dyn ResourceProbe>>,
}

impl Services {
    /// The production bindings: docker, tcpdump, geoiplookup, sysinfo and
    /// the configured alert channel.
    pub fn from_config(config: &FleetConfig) -> anyhow::Result<Self> {
        let capture = TcpdumpCapture::new(config.tracker.tcpdump_binary.clone())
            .context("building tcpdump line parser")?;
        Ok(Self {
            control: docker_control(config),
            capture: Arc::new(capture),
            lookup: Arc::new(GeoIpCommand::new(
                config.tracker.geoip_command.clone(),
                config.tracker.geoip6_command.clone(),
            )),
            classifier: FlowClassifier::from_interfaces(&config.local_addrs()),
            channel: channel_from_config(&config.notify.channel)
                .context("building alert channel")?,
            clock: Arc::new(SystemClock),
            resources: Some(Box::new(SysinfoProbe::new())),
        })
    }
}

pub fn docker_control(config: &FleetConfig) -> Arc<dyn WorkerControl> {
    Arc::new(DockerControl::new(
        config.fleet.docker_binary.clone(),
        DOCKER_COMMAND_TIMEOUT,
    ))
}

/// Running loops and the switch that stops them.
pub struct Daemon {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Daemon {
    /// Signal every loop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "loop ended abnormally");
            }
        }
        info!("all loops stopped");
    }
}

/// Start the four loops.
///
/// The store must already be open; each loop re-reads `source` at the
/// start of every cycle.
pub fn spawn(
    store: StateStore,
    source: Arc<ConfigSource>,
    services: Services,
) -> anyhow::Result<Daemon> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = source.current();
    let mut tasks = Vec::new();

    // Traffic tracker.
    let tracker = Tracker::resume(
        store.clone(),
        services.classifier,
        services.lookup,
        Arc::clone(&services.clock),
    )?;
    tasks.push((
        "tracker",
        tokio::spawn(tracker.run(Arc::clone(&source), services.capture, shutdown_rx.clone())),
    ));

    // Fleet status aggregator.
    let collector = FleetCollector::new(Arc::clone(&services.control), Arc::clone(&services.clock))
        .context("building status line parser")?
        .with_limits(config.fleet.max_in_flight, config.fleet.log_tail_lines);
    tasks.push((
        "status",
        tokio::spawn(collector.run(store.clone(), Arc::clone(&source), shutdown_rx.clone())),
    ));

    // Health watchdog.
    let mut watchdog = Watchdog::new(store.clone(), Arc::clone(&services.clock))
        .context("loading health records")?;
    if let Some(probe) = services.resources {
        watchdog = watchdog.with_resource_guard(ResourceGuard::new(probe));
    }
    tasks.push((
        "watchdog",
        tokio::spawn(Arc::new(watchdog).run(
            Arc::clone(&source),
            services.control,
            shutdown_rx.clone(),
        )),
    ));

    // Notification scheduler.
    let scheduler = Scheduler::new(store, services.clock);
    tasks.push((
        "notify",
        tokio::spawn(scheduler.run(Arc::clone(&source), services.channel, shutdown_rx)),
    ));

    info!(loops = tasks.len(), workers = config.fleet.size, "conduit daemon started");
    Ok(Daemon {
        shutdown: shutdown_tx,
        tasks,
    })
}
