//! conduit-tracker — which countries the fleet's peers come from, and how
//! many bytes each country moved.
//!
//! ```text
//!  tcpdump ──▶ FlowSample ──▶ FlowClassifier ──▶ GeoResolver ──▶ counters
//!                                 (direction)     (cached)         │
//!                                                                  ▼
//!                                                             StateStore
//! ```

pub mod capture;
pub mod flow;
pub mod geo;
pub mod peers;
pub mod tracker;

pub use capture::{CaptureError, CaptureFilter, PacketCapture, TcpdumpCapture};
pub use flow::{Direction, Flow, FlowClassifier, FlowSample, is_non_routable, mask_ip};
pub use geo::{GeoError, GeoIpCommand, GeoLookup, GeoResolver, parse_geoiplookup};
pub use peers::{PeerEntry, PeerTable};
pub use tracker::{CounterView, IngestStats, Tracker};
