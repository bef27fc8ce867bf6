//! Peer bookkeeping.

use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use lib_crypto::NodeId;

/// A peer is stale once unseen for this long (seconds).
pub const DEFAULT_STALENESS_SECS: u64 = 3600;

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A known peer in the overlay.
///
/// Identity is the node ID alone; address and port are routing hints that
/// may change across sessions. `last_seen` is refreshed by any inbound
/// message from the peer or any successful reply; `failed_pings` counts
/// request timeouts since the last contact.
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub last_seen: u64,
    pub failed_pings: u32,
}

impl Peer {
    pub fn new(node_id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            address: address.into(),
            port,
            last_seen: unix_now(),
            failed_pings: 0,
        }
    }

    /// `(host, port)` pair usable as a UDP send target.
    pub fn endpoint(&self) -> (&str, u16) {
        (self.address.as_str(), self.port)
    }

    /// Record a successful contact.
    pub fn touch(&mut self, now: u64) {
        self.last_seen = now;
        self.failed_pings = 0;
    }

    pub fn record_failed_ping(&mut self) {
        self.failed_pings += 1;
    }

    pub fn is_stale(&self, now: u64, staleness_secs: u64) -> bool {
        now.saturating_sub(self.last_seen) > staleness_secs
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}
