//! Docker CLI binding for [`WorkerControl`].

use std::time::Duration;

use tracing::{debug, info};

use crate::process::{describe, run_command};
use crate::worker::{BoxFuture, WorkerControl, WorkerError, WorkerHandle, WorkerInfo, WorkerResult};

/// Seconds docker waits for a graceful stop before killing the worker.
const STOP_GRACE_SECS: &str = "10";

/// Drives workers through the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerControl {
    binary: String,
    /// Budget for one docker invocation (stop/restart include the grace period).
    command_timeout: Duration,
}

impl DockerControl {
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    /// Run docker and return stdout, mapping a failed exit to an error.
    async fn docker(&self, args: &[&str]) -> WorkerResult<String> {
        let out = run_command(&self.binary, args, self.command_timeout).await?;
        if out.success {
            return Ok(out.stdout);
        }
        let stderr = out.stderr.trim().to_string();
        if stderr.contains("No such container") || stderr.contains("No such object") {
            // The last argument is always the container name.
            let name = args.last().copied().unwrap_or_default();
            return Err(WorkerError::NotFound(name.to_string()));
        }
        Err(WorkerError::Command {
            command: describe(&self.binary, args),
            code: out.code,
            stderr,
        })
    }
}

impl Default for DockerControl {
    fn default() -> Self {
        Self::new("docker", Duration::from_secs(30))
    }
}

impl WorkerControl for DockerControl {
    fn is_running<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<bool>> {
        Box::pin(async move {
            let args = ["inspect", "--format", "{{.State.Running}}", worker.control_endpoint.as_str()];
            match self.docker(&args).await {
                Ok(out) => Ok(out.trim() == "true"),
                Err(WorkerError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn start<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            self.docker(&["start", worker.control_endpoint.as_str()]).await?;
            info!(worker = %worker.id, "worker started");
            Ok(())
        })
    }

    fn stop<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            self.docker(&["stop", "-t", STOP_GRACE_SECS, worker.control_endpoint.as_str()])
                .await?;
            info!(worker = %worker.id, "worker stopped");
            Ok(())
        })
    }

    fn restart<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            self.docker(&["restart", "-t", STOP_GRACE_SECS, worker.control_endpoint.as_str()])
                .await?;
            info!(worker = %worker.id, "worker restarted");
            Ok(())
        })
    }

    fn tail_log<'a>(
        &'a self,
        worker: &'a WorkerHandle,
        lines: u32,
    ) -> BoxFuture<'a, WorkerResult<String>> {
        Box::pin(async move {
            let lines = lines.to_string();
            let args = ["logs", "--tail", lines.as_str(), worker.control_endpoint.as_str()];
            // Workers log to stderr; docker replays both streams separately.
            let out = run_command(&self.binary, &args, self.command_timeout).await?;
            if !out.success {
                return Err(WorkerError::Command {
                    command: describe(&self.binary, &args),
                    code: out.code,
                    stderr: out.stderr.trim().to_string(),
                });
            }
            debug!(worker = %worker.id, bytes = out.stdout.len() + out.stderr.len(), "log tail fetched");
            let mut combined = out.stdout;
            combined.push_str(&out.stderr);
            Ok(combined)
        })
    }

    fn inspect<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<WorkerInfo>> {
        Box::pin(async move {
            let args = [
                "inspect",
                "--format",
                "{{.State.Status}}|{{.State.StartedAt}}|{{.RestartCount}}",
                worker.control_endpoint.as_str(),
            ];
            let out = self.docker(&args).await?;
            Ok(parse_inspect(&out))
        })
    }
}

/// Parse the `status|startedAt|restartCount` line produced by `inspect`.
fn parse_inspect(out: &str) -> WorkerInfo {
    let mut parts = out.trim().splitn(3, '|');
    WorkerInfo {
        status: parts.next().unwrap_or_default().to_string(),
        started_at: parts.next().unwrap_or_default().to_string(),
        restart_count: parts
            .next()
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0),
    }
}
