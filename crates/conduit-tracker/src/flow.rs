//! Flow classification: which side of an observed packet is ours, and in
//! which direction the bytes went.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

/// One observed packet as reported by the capture facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSample {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote peer → this host.
    Inbound,
    /// This host → remote peer.
    Outbound,
}

/// A classified flow: the remote endpoint and the bytes exchanged with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub remote: IpAddr,
    pub direction: Direction,
    pub bytes: u64,
}

/// Decides direction from the set of addresses bound to this host.
#[derive(Debug, Clone, Default)]
pub struct FlowClassifier {
    local: HashSet<IpAddr>,
}

impl FlowClassifier {
    pub fn new(local: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            local: local.into_iter().collect(),
        }
    }

    /// Build from the host's interfaces plus configured extra addresses.
    ///
    /// If interfaces cannot be enumerated only the extras are used; the
    /// classifier then drops more flows as ambiguous but never misattributes.
    pub fn from_interfaces(extra: &[IpAddr]) -> Self {
        let mut local: HashSet<IpAddr> = extra.iter().copied().collect();
        match if_addrs::get_if_addrs() {
            Ok(ifaces) => {
                for iface in ifaces {
                    local.insert(iface.ip());
                }
            }
            Err(e) => warn!(error = %e, "failed to enumerate interfaces"),
        }
        debug!(addresses = local.len(), "flow classifier initialized");
        Self { local }
    }

    pub fn is_local(&self, ip: &IpAddr) -> bool {
        self.local.contains(ip)
    }

    /// Classify one packet.
    ///
    /// Returns `None` for ill-formed samples (zero length) and ambiguous
    /// ones where both or neither endpoint is local.
    pub fn classify(&self, src: IpAddr, dst: IpAddr, length: u64) -> Option<Flow> {
        if length == 0 {
            return None;
        }
        match (self.is_local(&src), self.is_local(&dst)) {
            (true, false) => Some(Flow {
                remote: dst,
                direction: Direction::Outbound,
                bytes: length,
            }),
            (false, true) => Some(Flow {
                remote: src,
                direction: Direction::Inbound,
                bytes: length,
            }),
            _ => None,
        }
    }

    pub fn classify_sample(&self, sample: &FlowSample) -> Option<Flow> {
        self.classify(sample.src, sample.dst, sample.length)
    }
}

/// Whether an address can never belong to a remote peer on the internet.
///
/// Covers private, loopback, link-local, CGNAT, unique-local, broadcast
/// and unspecified ranges.
pub fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_routable_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_non_routable_v4(&v4);
            }
            is_non_routable_v6(v6)
        }
    }
}

fn is_non_routable_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

fn is_non_routable_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Mask all but the first octet of an IPv4 address (and all but the first
/// group of IPv6) for logs and reports.
pub fn mask_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}.***.***.***", v4.octets()[0]),
        IpAddr::V6(v6) => format!("{:x}:****", v6.segments()[0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn classifier() -> FlowClassifier {
        FlowClassifier::new([ip("203.0.113.10"), ip("10.0.0.2")])
    }

    #[test]
    fn remote_source_is_inbound() {
        let flow = classifier()
            .classify(ip("85.1.2.3"), ip("203.0.113.10"), 1000)
            .unwrap();
        assert_eq!(flow.remote, ip("85.1.2.3"));
        assert_eq!(flow.direction, Direction::Inbound);
        assert_eq!(flow.bytes, 1000);
    }

    #[test]
    fn local_source_is_outbound() {
        let flow = classifier()
            .classify(ip("10.0.0.2"), ip("85.1.2.3"), 400)
            .unwrap();
        assert_eq!(flow.remote, ip("85.1.2.3"));
        assert_eq!(flow.direction, Direction::Outbound);
    }

    #[test]
    fn ambiguous_flows_are_dropped() {
        let c = classifier();
        // Both local.
        assert!(c.classify(ip("10.0.0.2"), ip("203.0.113.10"), 100).is_none());
        // Neither local.
        assert!(c.classify(ip("85.1.2.3"), ip("85.9.9.9"), 100).is_none());
    }

    #[test]
    fn zero_length_is_dropped() {
        assert!(classifier()
            .classify(ip("85.1.2.3"), ip("10.0.0.2"), 0)
            .is_none());
    }

    #[test]
    fn non_routable_ranges() {
        for addr in [
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.0.1",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fd00::1",
            "fe80::1",
            "::ffff:192.168.0.1",
        ] {
            assert!(is_non_routable(&ip(addr)), "{addr} should be non-routable");
        }
        for addr in ["8.8.8.8", "100.128.0.1", "2001:4860:4860::8888", "172.32.0.1"] {
            assert!(!is_non_routable(&ip(addr)), "{addr} should be routable");
        }
    }

    #[test]
    fn masking_keeps_first_group() {
        assert_eq!(mask_ip(&ip("85.1.2.3")), "85.***.***.***");
        assert_eq!(mask_ip(&ip("2001:db8::1")), "2001:****");
    }
}
