//! All four loops wired together over one in-memory store, with stub
//! bindings standing in for docker, tcpdump, geoiplookup and the alert
//! channel.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::{
    BoxFuture, ConfigSource, FleetConfig, ManualClock, WorkerControl, WorkerHandle, WorkerInfo,
    WorkerResult,
};
use conduit_notify::{AlertChannel, ChannelError};
use conduit_state::{HealthState, StateStore};
use conduit_tracker::{
    CaptureError, CaptureFilter, FlowClassifier, FlowSample, GeoError, GeoLookup, PacketCapture,
};
use conduitd::daemon::{self, Services};

/// 2026-10-18 06:05:00 UTC, five minutes into a periodic report slot.
const NOW: u64 = 1_792_281_600 + 6 * 3_600 + 300;
const LOCAL: &str = "203.0.113.7";

/// Workers that report a fixed status line; stopped ones start on restart.
struct FakeDocker {
    stopped: Mutex<HashSet<String>>,
    restarts: AtomicUsize,
}

impl FakeDocker {
    fn with_stopped(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            stopped: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            restarts: AtomicUsize::new(0),
        })
    }
}

impl WorkerControl for FakeDocker {
    fn is_running<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<bool>> {
        Box::pin(async move { Ok(!self.stopped.lock().unwrap().contains(&worker.id)) })
    }

    fn start<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            self.stopped.lock().unwrap().remove(&worker.id);
            Ok(())
        })
    }

    fn stop<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            self.stopped.lock().unwrap().insert(worker.id.clone());
            Ok(())
        })
    }

    fn restart<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.stopped.lock().unwrap().remove(&worker.id);
            Ok(())
        })
    }

    fn tail_log<'a>(
        &'a self,
        _worker: &'a WorkerHandle,
        _lines: u32,
    ) -> BoxFuture<'a, WorkerResult<String>> {
        Box::pin(async move {
            Ok("[STATS] Connecting: 1 | Connected: 15 | Up: 1.0 KB | Down: 2.0 KB | Uptime: 1h\n"
                .to_string())
        })
    }

    fn inspect<'a>(&'a self, _worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<WorkerInfo>> {
        Box::pin(async move { Ok(WorkerInfo::default()) })
    }
}

/// Sees one inbound packet from Germany in the first window, then silence.
#[derive(Default)]
struct OneFlowCapture {
    served: AtomicBool,
}

impl PacketCapture for OneFlowCapture {
    fn capture<'a>(
        &'a self,
        _filter: &'a CaptureFilter,
        window: Duration,
    ) -> BoxFuture<'a, Result<Vec<FlowSample>, CaptureError>> {
        Box::pin(async move {
            tokio::time::sleep(window).await;
            if self.served.swap(true, Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            Ok(vec![FlowSample {
                src: "85.1.2.3".parse().unwrap(),
                dst: LOCAL.parse().unwrap(),
                length: 1000,
            }])
        })
    }
}

struct EverywhereIsGermany;

impl GeoLookup for EverywhereIsGermany {
    fn lookup<'a>(&'a self, _ip: IpAddr) -> BoxFuture<'a, Result<Option<String>, GeoError>> {
        Box::pin(async move { Ok(Some("Germany".to_string())) })
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<String>>,
}

impl AlertChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        })
    }
}

fn config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.fleet.size = 2;
    config.watchdog.container_runtime_unit = String::new();
    config
}

#[tokio::test(start_paused = true)]
async fn loops_share_state_through_the_store() {
    let store = StateStore::open_in_memory().unwrap();
    let docker = FakeDocker::with_stopped(&["conduit-2"]);
    let channel = Arc::new(RecordingChannel::default());
    let services = Services {
        control: docker.clone(),
        capture: Arc::new(OneFlowCapture::default()),
        lookup: Arc::new(EverywhereIsGermany),
        classifier: FlowClassifier::new([LOCAL.parse::<IpAddr>().unwrap()]),
        channel: channel.clone(),
        clock: Arc::new(ManualClock::new(NOW)),
        resources: None,
    };

    let running = daemon::spawn(
        store.clone(),
        Arc::new(ConfigSource::fixed(config())),
        services,
    )
    .unwrap();
    // Long enough for a second status cycle and a second watchdog sweep.
    tokio::time::sleep(Duration::from_secs(70)).await;
    running.shutdown().await;

    // Watchdog restarted the stopped worker exactly once, and it recovered.
    assert_eq!(docker.restarts.load(Ordering::SeqCst), 1);
    let health = store.list_health().unwrap();
    assert_eq!(health.len(), 2);
    assert!(health.iter().all(|r| r.state == HealthState::Healthy));

    // Aggregator saw both workers after the restart.
    let snapshot = store.latest_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.total_count, 2);
    assert_eq!(snapshot.running_count, 2);
    assert_eq!(snapshot.connected, 30);
    assert_eq!(snapshot.upload_bytes, 2048);

    // Tracker attributed the flow to Germany and persisted it.
    let counters = store.load_counters().unwrap();
    let germany = counters.iter().find(|c| c.country == "Germany").unwrap();
    assert_eq!(germany.bytes_in, 1000);
    assert_eq!(germany.bytes_out, 0);

    // One periodic report, no alerts left behind.
    let sent = channel.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("Conduit status"));
    assert!(store.pending_alerts().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn counters_continue_after_restart() {
    let store = StateStore::open_in_memory().unwrap();
    for _ in 0..2 {
        let services = Services {
            control: FakeDocker::with_stopped(&[]),
            capture: Arc::new(OneFlowCapture::default()),
            lookup: Arc::new(EverywhereIsGermany),
            classifier: FlowClassifier::new([LOCAL.parse::<IpAddr>().unwrap()]),
            channel: Arc::new(RecordingChannel::default()),
            clock: Arc::new(ManualClock::new(NOW)),
            resources: None,
        };
        let running = daemon::spawn(
            store.clone(),
            Arc::new(ConfigSource::fixed(config())),
            services,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        running.shutdown().await;
    }

    let counters = store.load_counters().unwrap();
    let germany = counters.iter().find(|c| c.country == "Germany").unwrap();
    assert_eq!(germany.bytes_in, 2000);
}
