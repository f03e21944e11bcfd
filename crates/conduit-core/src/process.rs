//! Bounded-time execution of external commands.
//!
//! Every external collaborator the fleet shells out to (container runtime,
//! systemd, geo lookup) goes through [`run_command`], so a hung binary
//! costs at most its timeout and is killed when abandoned.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` to completion, killing it if `timeout` passes.
///
/// A non-zero exit is not an error here; callers decide what it means.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, ProcessError> {
    let command = describe(program, args);
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(ProcessError::Spawn { command, source }),
        Err(_) => return Err(ProcessError::Timeout { command, timeout }),
    };

    debug!(%command, code = ?output.status.code(), "command finished");
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Human-readable form of a command line for logs and errors.
pub fn describe(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}
