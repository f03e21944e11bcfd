//! Fleet status collection.
//!
//! Every worker is queried concurrently on a [`JoinSet`]. All queries share
//! one deadline, so a cycle takes at most `per_worker_timeout` however many
//! workers there are; a semaphore caps the number of simultaneous runtime
//! invocations, and a query still waiting for a permit when the deadline
//! passes counts as timed out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use conduit_core::{Clock, ConfigSource, WorkerControl, WorkerError, WorkerHandle};
use conduit_state::{FleetSnapshot, StateStore};

use crate::parser::StatusParser;

/// One worker's self-reported status at poll time. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSample {
    pub worker_id: String,
    pub connecting: u64,
    pub connected: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub uptime: Duration,
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("worker is not running")]
    NotRunning,

    #[error("no status line in the last {0} log lines")]
    NoStatus(u32),

    #[error("query did not finish before the deadline")]
    Timeout,

    #[error("query task failed: {0}")]
    Task(String),
}

/// Result of querying one worker.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub worker_id: String,
    pub display_name: String,
    pub result: Result<StatusSample, QueryError>,
}

/// A snapshot together with the per-worker outcomes it was built from.
#[derive(Debug)]
pub struct FleetCollection {
    pub snapshot: FleetSnapshot,
    pub workers: Vec<WorkerOutcome>,
}

pub struct FleetCollector {
    control: Arc<dyn WorkerControl>,
    parser: Arc<StatusParser>,
    clock: Arc<dyn Clock>,
    max_in_flight: usize,
    log_tail_lines: u32,
}

impl FleetCollector {
    pub fn new(
        control: Arc<dyn WorkerControl>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            control,
            parser: Arc::new(StatusParser::new()?),
            clock,
            max_in_flight: 16,
            log_tail_lines: 50,
        })
    }

    pub fn with_limits(mut self, max_in_flight: usize, log_tail_lines: u32) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self.log_tail_lines = log_tail_lines.max(1);
        self
    }

    /// Query all workers and sum the valid samples.
    pub async fn collect(
        &self,
        handles: &[WorkerHandle],
        per_worker_timeout: Duration,
    ) -> FleetSnapshot {
        self.collect_detailed(handles, per_worker_timeout)
            .await
            .snapshot
    }

    /// Like [`collect`](Self::collect), also returning each worker's outcome
    /// in handle order.
    pub async fn collect_detailed(
        &self,
        handles: &[WorkerHandle],
        per_worker_timeout: Duration,
    ) -> FleetCollection {
        let deadline = Instant::now() + per_worker_timeout;
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let now = self.clock.now_secs();
        let mut set = JoinSet::new();

        for (index, handle) in handles.iter().cloned().enumerate() {
            let control = Arc::clone(&self.control);
            let parser = Arc::clone(&self.parser);
            let permits = Arc::clone(&permits);
            let lines = self.log_tail_lines;
            set.spawn(async move {
                let query = async {
                    // The semaphore is never closed.
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| QueryError::Task(e.to_string()))?;
                    query_worker(control.as_ref(), &parser, &handle, lines, now).await
                };
                let result = match tokio::time::timeout_at(deadline, query).await {
                    Ok(result) => result,
                    Err(_) => Err(QueryError::Timeout),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<StatusSample, QueryError>>> =
            handles.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "status query task failed"),
            }
        }

        let mut snapshot = FleetSnapshot {
            total_count: handles.len() as u32,
            sampled_at: now,
            ..Default::default()
        };
        let mut workers = Vec::with_capacity(handles.len());
        for (handle, result) in handles.iter().zip(results) {
            let result = result.unwrap_or_else(|| Err(QueryError::Task("task aborted".into())));
            match &result {
                Ok(sample) => {
                    snapshot.running_count += 1;
                    snapshot.connecting = snapshot.connecting.saturating_add(sample.connecting);
                    snapshot.connected = snapshot.connected.saturating_add(sample.connected);
                    snapshot.upload_bytes = snapshot.upload_bytes.saturating_add(sample.upload_bytes);
                    snapshot.download_bytes =
                        snapshot.download_bytes.saturating_add(sample.download_bytes);
                }
                Err(QueryError::NotRunning) => {
                    debug!(worker = %handle.id, "worker not running");
                }
                Err(e) => {
                    warn!(worker = %handle.id, error = %e, "status query failed");
                }
            }
            workers.push(WorkerOutcome {
                worker_id: handle.id.clone(),
                display_name: handle.display_name.clone(),
                result,
            });
        }

        debug!(
            running = snapshot.running_count,
            total = snapshot.total_count,
            connected = snapshot.connected,
            "fleet status collected"
        );
        FleetCollection { snapshot, workers }
    }

    /// Collect and store the result as the latest snapshot.
    pub async fn collect_and_persist(
        &self,
        store: &StateStore,
        handles: &[WorkerHandle],
        per_worker_timeout: Duration,
    ) -> anyhow::Result<FleetSnapshot> {
        let snapshot = self.collect(handles, per_worker_timeout).await;
        store
            .put_latest_snapshot(&snapshot)
            .context("persisting fleet snapshot")?;
        Ok(snapshot)
    }

    /// Run the collection loop until shutdown, re-reading the config every
    /// cycle so fleet size and limits follow edits.
    pub async fn run(
        mut self,
        store: StateStore,
        source: Arc<ConfigSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("fleet status aggregator started");
        loop {
            let config = source.refresh();
            self.max_in_flight = config.fleet.max_in_flight.max(1);
            self.log_tail_lines = config.fleet.log_tail_lines.max(1);
            let handles = config.worker_handles();

            let outcome = tokio::select! {
                result = self.collect_and_persist(&store, &handles, config.query_timeout()) => Some(result),
                _ = shutdown.changed() => None,
            };
            match outcome {
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(error = %format!("{e:#}"), "status cycle failed"),
                None => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(config.status_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("fleet status aggregator shutting down");
    }
}

async fn query_worker(
    control: &dyn WorkerControl,
    parser: &StatusParser,
    handle: &WorkerHandle,
    lines: u32,
    now: u64,
) -> Result<StatusSample, QueryError> {
    if !control.is_running(handle).await? {
        return Err(QueryError::NotRunning);
    }
    let log = control.tail_log(handle, lines).await?;
    let status = parser.latest(&log).ok_or(QueryError::NoStatus(lines))?;
    Ok(StatusSample {
        worker_id: handle.id.clone(),
        connecting: status.connecting,
        connected: status.connected,
        upload_bytes: status.upload_bytes,
        download_bytes: status.download_bytes,
        uptime: Duration::from_secs(status.uptime_secs),
        timestamp: now,
    })
}
