//! Reverse proxy liveness over plain HTTP/1.1.
//!
//! One `GET` per probe on a fresh connection. Any 2xx or 3xx answer means
//! the proxy is up (Caddy redirects plain HTTP to HTTPS); 4xx and 5xx mean
//! it answered but is not serving; anything that prevents an answer is a
//! failed probe.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::checker::ProbeResult;

const USER_AGENT: &str = concat!("conduit-watchdog/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
enum CheckError {
    #[error("connect: {0}")]
    Connect(#[from] std::io::Error),
    #[error("request: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

/// Probe `http://{address}{path}` within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, fetch_status(address, path)).await {
        Ok(Ok(status)) => classify(status, address, path),
        Ok(Err(e)) => {
            debug!(%address, path, error = %e, "http probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, path, ?timeout, "http probe timed out");
            ProbeResult::Failed
        }
    }
}

fn classify(status: StatusCode, address: &str, path: &str) -> ProbeResult {
    if status.is_success() || status.is_redirection() {
        ProbeResult::Healthy
    } else {
        debug!(%address, path, %status, "http probe got an error status");
        ProbeResult::Unhealthy
    }
}

async fn fetch_status(address: &str, path: &str) -> Result<StatusCode, CheckError> {
    let stream = TcpStream::connect(address).await?;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(connection);

    let request = Request::get(path)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, USER_AGENT)
        .header(http::header::CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;
    let status = sender.send_request(request).await.map(|r| r.status());
    driver.abort();
    Ok(status?)
}
