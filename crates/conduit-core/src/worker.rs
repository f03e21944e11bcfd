//! Worker handles and the control interface the fleet loops drive them
//! through.
//!
//! The core never assumes a specific container runtime: every loop takes
//! an `Arc<dyn WorkerControl>`. [`crate::docker::DockerControl`] is the
//! binding shipped with the daemon.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::ProcessError;

/// Boxed future returned by the object-safe async interfaces of the fleet.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Control-plane reference to a single worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Stable identifier, also used as the health target ID.
    pub id: String,
    pub display_name: String,
    /// Name the container runtime knows the worker by.
    pub control_endpoint: String,
}

impl WorkerHandle {
    /// Handle for the `index`-th worker (1-based) of a fleet.
    ///
    /// The first worker keeps the bare prefix so a single-worker install
    /// and the first worker of a grown fleet are the same container.
    pub fn numbered(prefix: &str, index: u32) -> Self {
        let name = if index <= 1 {
            prefix.to_string()
        } else {
            format!("{prefix}-{index}")
        };
        Self {
            id: name.clone(),
            display_name: format!("Conduit #{index}"),
            control_endpoint: name,
        }
    }
}

/// Runtime details reported by `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Runtime status string, e.g. `running`, `exited`, `restarting`.
    pub status: String,
    /// Start timestamp as reported by the runtime.
    pub started_at: String,
    pub restart_count: u32,
}

/// Errors from driving a worker through its runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("worker not found: {0}")]
    NotFound(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Lifecycle and log access for workers, addressed by handle.
pub trait WorkerControl: Send + Sync {
    fn is_running<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<bool>>;

    fn start<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>>;

    fn stop<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>>;

    fn restart<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<()>>;

    /// The last `lines` lines of the worker's combined output.
    fn tail_log<'a>(
        &'a self,
        worker: &'a WorkerHandle,
        lines: u32,
    ) -> BoxFuture<'a, WorkerResult<String>>;

    fn inspect<'a>(&'a self, worker: &'a WorkerHandle) -> BoxFuture<'a, WorkerResult<WorkerInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_worker_keeps_bare_prefix() {
        let first = WorkerHandle::numbered("conduit", 1);
        assert_eq!(first.id, "conduit");
        assert_eq!(first.control_endpoint, "conduit");
        assert_eq!(first.display_name, "Conduit #1");

        let third = WorkerHandle::numbered("conduit", 3);
        assert_eq!(third.id, "conduit-3");
    }
}
