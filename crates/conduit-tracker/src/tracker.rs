//! The tracker loop: capture a window, classify flows, attribute bytes to
//! countries, persist.
//!
//! Counters only grow. They are restored from the store on start and the
//! full table is written back after every window, so a crash loses at most
//! the window in progress and a restart resumes from the persisted totals.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use conduit_core::{Clock, ConfigSource};
use conduit_state::{CountryCounter, StateStore, TrafficBatch};

use crate::capture::{CaptureFilter, PacketCapture};
use crate::flow::{Direction, FlowClassifier, FlowSample};
use crate::geo::{GeoLookup, GeoResolver};
use crate::peers::PeerTable;

/// Outcome of ingesting one batch of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: usize,
    /// Ambiguous or ill-formed samples.
    pub dropped: usize,
    pub bytes: u64,
}

/// Read handle on the live counter table.
#[derive(Clone, Default)]
pub struct CounterView {
    inner: Arc<RwLock<HashMap<String, CountryCounter>>>,
}

impl CounterView {
    /// All counters, largest total first.
    pub async fn snapshot(&self) -> Vec<CountryCounter> {
        let counters = self.inner.read().await;
        let mut out: Vec<CountryCounter> = counters.values().cloned().collect();
        out.sort_by(|a, b| b.total().cmp(&a.total()).then(a.country.cmp(&b.country)));
        out
    }

    pub async fn get(&self, country: &str) -> Option<CountryCounter> {
        self.inner.read().await.get(country).cloned()
    }
}

pub struct Tracker {
    store: StateStore,
    classifier: FlowClassifier,
    resolver: GeoResolver,
    counters: CounterView,
    peers: PeerTable,
    clock: Arc<dyn Clock>,
}

impl Tracker {
    /// Build a tracker that continues from the counters and geo cache in
    /// `store`.
    pub fn resume(
        store: StateStore,
        classifier: FlowClassifier,
        lookup: Arc<dyn GeoLookup>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let counters: HashMap<String, CountryCounter> = store
            .load_counters()
            .context("loading country counters")?
            .into_iter()
            .map(|c| (c.country.clone(), c))
            .collect();
        let cache = store.load_geo_cache().context("loading geo cache")?;
        info!(
            countries = counters.len(),
            cached_ips = cache.len(),
            "tracker resumed from store"
        );
        Ok(Self {
            store,
            classifier,
            resolver: GeoResolver::new(lookup, cache),
            counters: CounterView {
                inner: Arc::new(RwLock::new(counters)),
            },
            peers: PeerTable::new(),
            clock,
        })
    }

    pub fn counters(&self) -> CounterView {
        self.counters.clone()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Account one observed packet.
    pub async fn record_flow(&mut self, src: IpAddr, dst: IpAddr, length: u64) -> bool {
        let stats = self.ingest(&[FlowSample { src, dst, length }]).await;
        stats.accepted == 1
    }

    /// Classify, resolve and count a batch of samples. Each batch gives
    /// addresses whose lookup failed earlier one fresh attempt.
    pub async fn ingest(&mut self, samples: &[FlowSample]) -> IngestStats {
        let now = self.clock.now_secs();
        self.resolver.forget_failures();
        let mut stats = IngestStats::default();
        let mut resolved = Vec::with_capacity(samples.len());

        for sample in samples {
            let Some(flow) = self.classifier.classify_sample(sample) else {
                stats.dropped += 1;
                continue;
            };
            let country = self.resolver.resolve_country(flow.remote).await;
            self.peers.observe(flow.remote, &country, flow.bytes, now);
            resolved.push((country, flow));
        }

        let mut counters = self.counters.inner.write().await;
        for (country, flow) in resolved {
            let counter = counters
                .entry(country.clone())
                .or_insert_with(|| CountryCounter::new(country));
            match flow.direction {
                Direction::Inbound => counter.bytes_in = counter.bytes_in.saturating_add(flow.bytes),
                Direction::Outbound => {
                    counter.bytes_out = counter.bytes_out.saturating_add(flow.bytes)
                }
            }
            stats.accepted += 1;
            stats.bytes = stats.bytes.saturating_add(flow.bytes);
        }
        stats
    }

    /// Drop peers idle longer than `timeout`.
    pub fn prune_peers(&mut self, timeout: Duration) -> usize {
        self.peers.prune(self.clock.now_secs(), timeout)
    }

    /// Write counters, live peers and newly learned geo entries in one
    /// transaction. On failure the geo entries are kept for the next try.
    pub async fn persist(&mut self) -> anyhow::Result<()> {
        let counters = self.counters.snapshot().await;
        let peers = self.peers.summaries();
        let new_geo = self.resolver.take_new_entries();
        let batch = TrafficBatch {
            counters: &counters,
            new_geo_entries: &new_geo,
            peers: &peers,
        };
        if let Err(e) = self.store.persist_traffic(&batch) {
            self.resolver.restore_new_entries(new_geo);
            return Err(e).context("persisting traffic counters");
        }
        Ok(())
    }

    /// Zero all counters in memory and in the store.
    pub async fn reset(&mut self) -> anyhow::Result<()> {
        self.store.reset_counters().context("resetting counters")?;
        self.counters.inner.write().await.clear();
        self.peers = PeerTable::new();
        info!("country counters reset");
        Ok(())
    }

    /// One full cycle: capture, ingest, prune, persist.
    pub async fn run_cycle(
        &mut self,
        capture: &dyn PacketCapture,
        filter: &CaptureFilter,
        window: Duration,
        peer_timeout: Duration,
    ) -> anyhow::Result<IngestStats> {
        let samples = capture
            .capture(filter, window)
            .await
            .context("packet capture failed")?;
        let stats = self.ingest(&samples).await;
        let pruned = self.prune_peers(peer_timeout);
        self.persist().await?;
        debug!(
            accepted = stats.accepted,
            dropped = stats.dropped,
            bytes = stats.bytes,
            active_peers = self.peers.len(),
            pruned,
            "tracker cycle complete"
        );
        Ok(stats)
    }

    /// Run cycles until shutdown, re-reading the config before each one.
    pub async fn run(
        mut self,
        source: Arc<ConfigSource>,
        capture: Arc<dyn PacketCapture>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("traffic tracker started");
        loop {
            let config = source.refresh();
            let window = config.capture_window();

            if !config.tracker.enabled {
                tokio::select! {
                    _ = tokio::time::sleep(window) => continue,
                    _ = shutdown.changed() => break,
                }
            }

            let filter = CaptureFilter {
                interface: config.tracker.interface.clone(),
                ports: config.fleet.ports.clone(),
            };
            let peer_timeout = config.peer_timeout();

            let outcome = tokio::select! {
                result = self.run_cycle(capture.as_ref(), &filter, window, peer_timeout) => Some(result),
                _ = shutdown.changed() => None,
            };

            match outcome {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %format!("{e:#}"), "tracker cycle failed, retrying next window");
                    tokio::select! {
                        _ = tokio::time::sleep(window) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => break,
            }
        }

        info!("traffic tracker shutting down");
        if let Err(e) = self.persist().await {
            warn!(error = %format!("{e:#}"), "final counter persist failed");
        }
    }
}
