//! Live peer table: remote addresses seen recently, with their country, the
//! bytes exchanged while they stayed active and their recent rate.
//!
//! The rate is bytes accumulated since the last rate update divided by the
//! seconds elapsed, refreshed once at least [`RATE_INTERVAL_SECS`] have
//! passed. A peer seen in only one batch has no rate yet.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use conduit_state::PeerSummary;

pub const RATE_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub country: String,
    pub bytes: u64,
    pub last_seen: u64,
    /// Bytes per second over the last rate interval.
    pub rate_bps: u64,
    pending_bytes: u64,
    rate_since: u64,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<IpAddr, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from `ip` at `now` (epoch seconds).
    pub fn observe(&mut self, ip: IpAddr, country: &str, bytes: u64, now: u64) {
        let entry = self.peers.entry(ip).or_insert_with(|| PeerEntry {
            country: country.to_string(),
            bytes: 0,
            last_seen: now,
            rate_bps: 0,
            pending_bytes: 0,
            rate_since: now,
        });
        entry.bytes = entry.bytes.saturating_add(bytes);
        entry.last_seen = entry.last_seen.max(now);
        let elapsed = now.saturating_sub(entry.rate_since);
        if elapsed >= RATE_INTERVAL_SECS {
            entry.rate_bps = entry.pending_bytes / elapsed;
            entry.pending_bytes = 0;
            entry.rate_since = now;
        }
        entry.pending_bytes = entry.pending_bytes.saturating_add(bytes);
        if entry.country != country {
            entry.country = country.to_string();
        }
    }

    /// Drop peers idle for longer than `timeout`; returns how many left.
    pub fn prune(&mut self, now: u64, timeout: Duration) -> usize {
        let before = self.peers.len();
        let timeout = timeout.as_secs();
        self.peers
            .retain(|_, p| now.saturating_sub(p.last_seen) <= timeout);
        before - self.peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&PeerEntry> {
        self.peers.get(ip)
    }

    /// Active peers, their bytes and combined rate per country, busiest
    /// country first.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut by_country: BTreeMap<&str, PeerSummary> = BTreeMap::new();
        for peer in self.peers.values() {
            let slot = by_country
                .entry(peer.country.as_str())
                .or_insert_with(|| PeerSummary {
                    country: peer.country.clone(),
                    active_peers: 0,
                    bytes: 0,
                    rate_bps: 0,
                });
            slot.active_peers += 1;
            slot.bytes = slot.bytes.saturating_add(peer.bytes);
            slot.rate_bps = slot.rate_bps.saturating_add(peer.rate_bps);
        }
        let mut out: Vec<PeerSummary> = by_country.into_values().collect();
        out.sort_by(|a, b| {
            b.active_peers
                .cmp(&a.active_peers)
                .then(b.bytes.cmp(&a.bytes))
        });
        out
    }
}
