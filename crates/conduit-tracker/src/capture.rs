//! Packet observation.
//!
//! The tracker needs one thing from the capture facility: for a bounded
//! window, the (source, destination, length) of packets matching a port
//! filter. [`TcpdumpCapture`] gets it by running `tcpdump` in line-buffered
//! quiet mode and parsing its output.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use conduit_core::BoxFuture;

use crate::flow::FlowSample;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to launch `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("capture output unavailable")]
    NoOutput,

    #[error("invalid line pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
    pub interface: String,
    /// Only packets to or from these ports; empty captures everything.
    pub ports: Vec<u16>,
}

impl CaptureFilter {
    /// BPF expression tokens for the port filter.
    pub fn bpf(&self) -> Vec<String> {
        let mut expr = Vec::new();
        for (i, port) in self.ports.iter().enumerate() {
            if i > 0 {
                expr.push("or".to_string());
            }
            expr.push("port".to_string());
            expr.push(port.to_string());
        }
        expr
    }
}

pub trait PacketCapture: Send + Sync {
    /// Observe packets for `window` and return what was seen.
    fn capture<'a>(
        &'a self,
        filter: &'a CaptureFilter,
        window: Duration,
    ) -> BoxFuture<'a, Result<Vec<FlowSample>, CaptureError>>;
}

pub struct TcpdumpCapture {
    binary: String,
    line_re: Regex,
}

impl TcpdumpCapture {
    pub fn new(binary: impl Into<String>) -> Result<Self, CaptureError> {
        // e.g. `eth0 In IP 85.1.2.3.51234 > 10.0.0.2.443: UDP, length 1200`
        //      `IP 10.0.0.2.443 > 85.1.2.3.51234: tcp 1448`
        let line_re = Regex::new(
            r"IP6?\s+(\S+)\.\d+\s+>\s+(\S+)\.\d+:\s+(?:UDP,\s+length|tcp|udp)\s+(\d+)",
        )?;
        Ok(Self {
            binary: binary.into(),
            line_re,
        })
    }

    /// Parse one line of `tcpdump -nn -q -t` output.
    pub fn parse_line(&self, line: &str) -> Option<FlowSample> {
        let caps = self.line_re.captures(line)?;
        let src: IpAddr = caps.get(1)?.as_str().parse().ok()?;
        let dst: IpAddr = caps.get(2)?.as_str().parse().ok()?;
        let length: u64 = caps.get(3)?.as_str().parse().ok()?;
        Some(FlowSample { src, dst, length })
    }

    fn args(filter: &CaptureFilter) -> Vec<String> {
        let mut args: Vec<String> = ["-i", filter.interface.as_str(), "-nn", "-q", "-l", "-t"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(filter.bpf());
        args
    }
}

impl PacketCapture for TcpdumpCapture {
    fn capture<'a>(
        &'a self,
        filter: &'a CaptureFilter,
        window: Duration,
    ) -> BoxFuture<'a, Result<Vec<FlowSample>, CaptureError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.binary)
                .args(Self::args(filter))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| CaptureError::Spawn {
                    binary: self.binary.clone(),
                    source,
                })?;

            let stdout = child.stdout.take().ok_or(CaptureError::NoOutput)?;
            let mut lines = BufReader::new(stdout).lines();
            let deadline = Instant::now() + window;
            let mut samples = Vec::new();
            let mut unparsed = 0usize;
            let mut exited_early = false;

            loop {
                match tokio::time::timeout_at(deadline, lines.next_line()).await {
                    Ok(Ok(Some(line))) => match self.parse_line(&line) {
                        Some(sample) => samples.push(sample),
                        None => unparsed += 1,
                    },
                    Ok(Ok(None)) => {
                        exited_early = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "error reading capture output");
                        break;
                    }
                    Err(_) => break,
                }
            }

            if !exited_early {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "capture already exited");
                }
            }
            let status = child.wait().await.ok();
            if exited_early && samples.is_empty() {
                let success = status.map(|s| s.success()).unwrap_or(false);
                if !success {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr).await;
                    }
                    return Err(CaptureError::Exited {
                        code: status.and_then(|s| s.code()),
                        stderr: stderr.trim().to_string(),
                    });
                }
            }

            debug!(samples = samples.len(), unparsed, "capture window closed");
            Ok(samples)
        })
    }
}
