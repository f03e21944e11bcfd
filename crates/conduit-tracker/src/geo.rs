//! Country resolution for remote peers.
//!
//! [`GeoResolver`] fronts a [`GeoLookup`] with a durable cache. Answers
//! from the database (including "not found") are cached; lookup failures
//! degrade to `Unknown` for that flow only and are retried next time.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use conduit_core::process::describe;
use conduit_core::{BoxFuture, ProcessError, run_command};
use conduit_state::{LOCAL_COUNTRY, UNKNOWN_COUNTRY};

use crate::flow::is_non_routable;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("`{command}` failed: {detail}")]
    Failed { command: String, detail: String },
}

/// Source of IP → country answers.
pub trait GeoLookup: Send + Sync {
    /// `Ok(None)` means the database has no entry for the address.
    fn lookup<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, Result<Option<String>, GeoError>>;
}

/// Looks addresses up with the `geoiplookup` family of commands.
#[derive(Debug, Clone)]
pub struct GeoIpCommand {
    v4_binary: String,
    v6_binary: String,
    timeout: Duration,
}

impl GeoIpCommand {
    pub fn new(v4_binary: impl Into<String>, v6_binary: impl Into<String>) -> Self {
        Self {
            v4_binary: v4_binary.into(),
            v6_binary: v6_binary.into(),
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl GeoLookup for GeoIpCommand {
    fn lookup<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, Result<Option<String>, GeoError>> {
        Box::pin(async move {
            let binary = match ip {
                IpAddr::V4(_) => &self.v4_binary,
                IpAddr::V6(_) => &self.v6_binary,
            };
            let addr = ip.to_string();
            let args = [addr.as_str()];
            let out = run_command(binary, &args, self.timeout).await?;
            if !out.success {
                return Err(GeoError::Failed {
                    command: describe(binary, &args),
                    detail: out.stderr.trim().to_string(),
                });
            }
            parse_geoiplookup(&out.stdout).ok_or_else(|| GeoError::Failed {
                command: describe(binary, &args),
                detail: format!("unrecognized output: {}", out.stdout.trim()),
            })
        })
    }
}

/// Parse `geoiplookup` output.
///
/// `GeoIP Country Edition: DE, Germany` yields `Some(Some("Germany"))`,
/// `... Edition: IP Address not found` yields `Some(None)`, anything else
/// (missing database, garbage) yields `None`.
pub fn parse_geoiplookup(output: &str) -> Option<Option<String>> {
    for line in output.lines() {
        let Some((label, answer)) = line.split_once(": ") else {
            continue;
        };
        if !(label.contains("Country") && label.contains("Edition")) {
            continue;
        }
        let answer = answer.trim();
        if answer.starts_with("IP Address not found") {
            return Some(None);
        }
        let name = match answer.split_once(", ") {
            Some((_, name)) => name.trim(),
            None => answer,
        };
        if name.is_empty() {
            return Some(None);
        }
        return Some(Some(name.to_string()));
    }
    None
}

/// Cached country resolution.
pub struct GeoResolver {
    lookup: Arc<dyn GeoLookup>,
    cache: HashMap<String, String>,
    /// Entries learned since the last [`take_new_entries`](Self::take_new_entries).
    new_entries: Vec<(String, String)>,
    /// Addresses whose lookup failed since the last
    /// [`forget_failures`](Self::forget_failures); answered `Unknown` without
    /// asking again.
    failed: HashSet<IpAddr>,
}

impl GeoResolver {
    pub fn new(lookup: Arc<dyn GeoLookup>, cache: HashMap<String, String>) -> Self {
        Self {
            lookup,
            cache,
            new_entries: Vec::new(),
            failed: HashSet::new(),
        }
    }

    /// Country for `ip`: `LOCAL` for non-routable ranges (no lookup, not
    /// cached), a cached answer, or a fresh lookup. An address whose lookup
    /// already failed this cycle is `Unknown` without another lookup.
    pub async fn resolve_country(&mut self, ip: IpAddr) -> String {
        if is_non_routable(&ip) {
            return LOCAL_COUNTRY.to_string();
        }
        let key = ip.to_string();
        if let Some(country) = self.cache.get(&key) {
            return country.clone();
        }
        if self.failed.contains(&ip) {
            return UNKNOWN_COUNTRY.to_string();
        }
        match self.lookup.lookup(ip).await {
            Ok(answer) => {
                let country = answer.unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
                debug!(ip = %crate::flow::mask_ip(&ip), %country, "geo lookup");
                self.cache.insert(key.clone(), country.clone());
                self.new_entries.push((key, country.clone()));
                country
            }
            Err(e) => {
                warn!(ip = %crate::flow::mask_ip(&ip), error = %e, "geo lookup failed");
                self.failed.insert(ip);
                UNKNOWN_COUNTRY.to_string()
            }
        }
    }

    /// Allow failed addresses to be looked up again. Called once per cycle.
    pub fn forget_failures(&mut self) {
        self.failed.clear();
    }

    /// Drain entries not yet persisted.
    pub fn take_new_entries(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.new_entries)
    }

    /// Put back entries whose persistence failed so the next cycle retries.
    pub fn restore_new_entries(&mut self, mut entries: Vec<(String, String)>) {
        entries.append(&mut self.new_entries);
        self.new_entries = entries;
    }

    pub fn cached(&self, ip: &IpAddr) -> Option<&str> {
        self.cache.get(&ip.to_string()).map(String::as_str)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
