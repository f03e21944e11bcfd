//! Things the watchdog supervises.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use conduit_core::process::describe;
use conduit_core::{BoxFuture, FleetConfig, WorkerControl, WorkerHandle, run_command};

use crate::checker::ProbeResult;
use crate::error::{HealthError, HealthResult};
use crate::http_check::http_probe;

/// Budget for one `systemctl` invocation.
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(60);

/// A supervised target: something that can be probed and, when unhealthy,
/// restarted in place.
pub trait MonitoredTarget: Send + Sync {
    /// Stable identifier, used as the health record key.
    fn id(&self) -> &str;

    /// Check health. Implementations must not outlive `timeout`.
    fn probe<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProbeResult>;

    /// Restart just this target.
    fn recover<'a>(&'a self) -> BoxFuture<'a, HealthResult<()>>;
}

/// A fleet worker: healthy while its container runs.
pub struct WorkerTarget {
    handle: WorkerHandle,
    control: Arc<dyn WorkerControl>,
}

impl WorkerTarget {
    pub fn new(handle: WorkerHandle, control: Arc<dyn WorkerControl>) -> Self {
        Self { handle, control }
    }
}

impl MonitoredTarget for WorkerTarget {
    fn id(&self) -> &str {
        &self.handle.id
    }

    fn probe<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.control.is_running(&self.handle)).await {
                Ok(Ok(true)) => ProbeResult::Healthy,
                Ok(Ok(false)) => ProbeResult::Unhealthy,
                Ok(Err(e)) => {
                    debug!(worker = %self.handle.id, error = %e, "worker probe failed");
                    ProbeResult::Failed
                }
                Err(_) => ProbeResult::Failed,
            }
        })
    }

    fn recover<'a>(&'a self) -> BoxFuture<'a, HealthResult<()>> {
        Box::pin(async move {
            self.control.restart(&self.handle).await?;
            Ok(())
        })
    }
}

/// A systemd unit: healthy while `systemctl is-active` says so.
#[derive(Debug, Clone)]
pub struct SystemdUnitTarget {
    unit: String,
    systemctl: String,
}

impl SystemdUnitTarget {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            systemctl: "systemctl".to_string(),
        }
    }

    pub fn with_systemctl(mut self, binary: impl Into<String>) -> Self {
        self.systemctl = binary.into();
        self
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    async fn restart_unit(&self) -> HealthResult<()> {
        let args = ["restart", self.unit.as_str()];
        let out = run_command(&self.systemctl, &args, SYSTEMCTL_TIMEOUT).await?;
        if !out.success {
            return Err(HealthError::Command {
                command: describe(&self.systemctl, &args),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        info!(unit = %self.unit, "unit restarted");
        Ok(())
    }
}

impl MonitoredTarget for SystemdUnitTarget {
    fn id(&self) -> &str {
        &self.unit
    }

    fn probe<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            let args = ["is-active", "--quiet", self.unit.as_str()];
            match run_command(&self.systemctl, &args, timeout).await {
                Ok(out) if out.success => ProbeResult::Healthy,
                Ok(_) => ProbeResult::Unhealthy,
                Err(e) => {
                    debug!(unit = %self.unit, error = %e, "unit probe failed");
                    ProbeResult::Failed
                }
            }
        })
    }

    fn recover<'a>(&'a self) -> BoxFuture<'a, HealthResult<()>> {
        Box::pin(self.restart_unit())
    }
}

/// An HTTP service run by a systemd unit: probed over HTTP, recovered by
/// restarting the unit.
pub struct HttpServiceTarget {
    id: String,
    address: String,
    path: String,
    unit: SystemdUnitTarget,
}

impl HttpServiceTarget {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        path: impl Into<String>,
        unit: SystemdUnitTarget,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            path: path.into(),
            unit,
        }
    }
}

impl MonitoredTarget for HttpServiceTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn probe<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(http_probe(&self.address, &self.path, timeout))
    }

    fn recover<'a>(&'a self) -> BoxFuture<'a, HealthResult<()>> {
        Box::pin(self.unit.restart_unit())
    }
}

/// All targets the configuration asks the watchdog to supervise: every
/// worker, the container runtime unit and the optional reverse proxy.
pub fn targets_from_config(
    config: &FleetConfig,
    control: &Arc<dyn WorkerControl>,
) -> Vec<Arc<dyn MonitoredTarget>> {
    let mut targets: Vec<Arc<dyn MonitoredTarget>> = config
        .worker_handles()
        .into_iter()
        .map(|handle| {
            Arc::new(WorkerTarget::new(handle, Arc::clone(control))) as Arc<dyn MonitoredTarget>
        })
        .collect();

    let runtime = config.watchdog.container_runtime_unit.trim();
    if !runtime.is_empty() {
        targets.push(Arc::new(SystemdUnitTarget::new(runtime)));
    }

    if let Some(proxy) = &config.watchdog.reverse_proxy {
        targets.push(Arc::new(HttpServiceTarget::new(
            format!("{}-http", proxy.unit),
            proxy.address.clone(),
            proxy.health_path.clone(),
            SystemdUnitTarget::new(proxy.unit.clone()),
        )));
    }
    targets
}
