use thiserror::Error;

use conduit_core::{ProcessError, WorkerError};
use conduit_state::StateError;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("target {target_id} is down; automatic recovery is suspended")]
    TargetDown { target_id: String },

    #[error("target {target_id} was restarted {elapsed_secs}s ago; cooling down")]
    CoolingDown { target_id: String, elapsed_secs: u64 },

    #[error("restart task failed: {0}")]
    RestartTask(String),
}

pub type HealthResult<T> = Result<T, HealthError>;
