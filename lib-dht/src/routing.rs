//! Kademlia routing table: 160 LRU k-buckets.
//!
//! Each bucket holds up to k peers in a fixed XOR-distance range from the
//! local node, least recently seen at the front. A full bucket only accepts
//! a new peer by evicting its oldest stale member; fresh, responsive peers
//! are never displaced.

use lib_crypto::NodeId;
use rand::Rng;

use crate::distance::{bucket_index, xor_distance, BUCKET_COUNT};
use crate::peer::{unix_now, Peer, DEFAULT_STALENESS_SECS};

/// One k-bucket: peers in LRU order, least recently seen first.
#[derive(Debug, Clone)]
pub struct KBucket {
    peers: Vec<Peer>,
    /// Last insertion or touch; drives periodic refresh.
    pub last_updated: u64,
}

impl KBucket {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            last_updated: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self, k: usize) -> bool {
        self.peers.len() >= k
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.iter().any(|p| &p.node_id == node_id)
    }

    /// Move an existing peer to the most-recently-seen position.
    fn touch(&mut self, node_id: &NodeId, now: u64) -> bool {
        let Some(pos) = self.peers.iter().position(|p| &p.node_id == node_id) else {
            return false;
        };
        let mut peer = self.peers.remove(pos);
        peer.touch(now);
        self.peers.push(peer);
        self.last_updated = now;
        true
    }

    fn push(&mut self, peer: Peer, now: u64) {
        self.peers.push(peer);
        self.last_updated = now;
    }

    fn remove(&mut self, node_id: &NodeId) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| &p.node_id == node_id)?;
        Some(self.peers.remove(pos))
    }

    /// Evict the oldest stale peer, scanning from the LRU end.
    fn evict_stale(&mut self, now: u64, staleness_secs: u64) -> Option<Peer> {
        let pos = self
            .peers
            .iter()
            .position(|p| p.is_stale(now, staleness_secs))?;
        Some(self.peers.remove(pos))
    }
}

/// Point-in-time routing table numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingStats {
    pub total_peers: usize,
    pub buckets_used: usize,
    pub stale_peers: usize,
}

/// The routing table for one node.
///
/// Invariants: the local ID is never stored, a node ID appears in at most
/// one bucket, and every bucket holds at most k peers.
#[derive(Debug)]
pub struct RoutingTable {
    node_id: NodeId,
    k: usize,
    staleness_secs: u64,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(node_id: NodeId, k: usize) -> Self {
        Self {
            node_id,
            k,
            staleness_secs: DEFAULT_STALENESS_SECS,
            buckets: (0..BUCKET_COUNT).map(|_| KBucket::new()).collect(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Register or refresh a peer.
    ///
    /// Known peers get an LRU touch. New peers are appended while the
    /// bucket has room; a full bucket accepts the peer only by evicting its
    /// oldest stale member. Returns false when the peer could not be
    /// placed (full bucket, nobody stale) or is the local node.
    pub fn add(&mut self, peer: Peer) -> bool {
        if peer.node_id == self.node_id || peer.node_id.is_zero() {
            return false;
        }

        let now = unix_now();
        let idx = bucket_index(&self.node_id, &peer.node_id);
        let k = self.k;
        let staleness = self.staleness_secs;
        let bucket = &mut self.buckets[idx];

        if bucket.touch(&peer.node_id, now) {
            return true;
        }
        if !bucket.is_full(k) {
            bucket.push(peer, now);
            return true;
        }
        if bucket.evict_stale(now, staleness).is_some() {
            bucket.push(peer, now);
            return true;
        }
        false
    }

    /// Remove a peer. Idempotent.
    pub fn remove(&mut self, node_id: &NodeId) {
        let idx = bucket_index(&self.node_id, node_id);
        self.buckets[idx].remove(node_id);
    }

    /// Record a request timeout against a peer.
    pub fn mark_failed(&mut self, node_id: &NodeId) {
        let idx = bucket_index(&self.node_id, node_id);
        if let Some(peer) = self.buckets[idx]
            .peers
            .iter_mut()
            .find(|p| &p.node_id == node_id)
        {
            peer.record_failed_ping();
        }
    }

    /// The `count` known peers closest to `target` by XOR distance.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Peer> {
        let mut all: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter().cloned())
            .collect();
        all.sort_by_key(|p| xor_distance(&p.node_id, target));
        all.truncate(count);
        all
    }

    /// Every known peer, in bucket-index order.
    pub fn all(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    /// Indices of non-empty buckets that have not been touched within
    /// `interval_secs`.
    pub fn buckets_needing_refresh(&self, now: u64, interval_secs: u64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && now.saturating_sub(b.last_updated) > interval_secs)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, index: usize, now: u64) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.last_updated = now;
        }
    }

    /// A random ID whose distance from the local node falls in the given
    /// bucket: the bit at `index` is flipped and every lower-order bit is
    /// randomized.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut id = *self.node_id.as_bytes();
        let byte_idx = index / 8;
        let bit_in_byte = index % 8;

        id[byte_idx] ^= 0x80 >> bit_in_byte;

        let mut rng = rand::thread_rng();
        let tail_bits = 7 - bit_in_byte as u32;
        if tail_bits > 0 {
            let mask = (1u8 << tail_bits) - 1;
            id[byte_idx] = (id[byte_idx] & !mask) | (rng.gen::<u8>() & mask);
        }
        for byte in id.iter_mut().skip(byte_idx + 1) {
            *byte = rng.gen();
        }
        NodeId::from_bytes(id)
    }

    pub fn stats(&self, now: u64) -> RoutingStats {
        RoutingStats {
            total_peers: self.len(),
            buckets_used: self.buckets.iter().filter(|b| !b.is_empty()).count(),
            stale_peers: self
                .buckets
                .iter()
                .flat_map(|b| b.peers.iter())
                .filter(|p| p.is_stale(now, self.staleness_secs))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(bytes: [u8; 20]) -> NodeId {
        NodeId::from_bytes(bytes)
    }

    fn peer(id_byte: u8) -> Peer {
        let mut id = [0u8; 20];
        id[19] = id_byte;
        Peer::new(nid(id), "127.0.0.1", 8468)
    }

    /// IDs that all land in the same bucket relative to an all-zero local ID.
    fn same_bucket_peer(low: u8) -> Peer {
        let mut id = [0u8; 20];
        id[0] = 0x80;
        id[19] = low;
        Peer::new(nid(id), "127.0.0.1", 8468)
    }

    #[test]
    fn self_is_never_stored() {
        let local = nid([5; 20]);
        let mut table = RoutingTable::new(local, 20);

        assert!(!table.add(Peer::new(local, "127.0.0.1", 1)));
        assert!(table.is_empty());
    }

    #[test]
    fn zero_id_is_never_stored() {
        let mut table = RoutingTable::new(nid([5; 20]), 20);
        assert!(!table.add(Peer::new(NodeId::zero(), "127.0.0.1", 1)));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_add_is_lru_touch() {
        let mut table = RoutingTable::new(nid([0; 20]), 4);
        for low in 1..=3 {
            assert!(table.add(same_bucket_peer(low)));
        }

        // Re-adding peer 1 moves it to the tail of its bucket.
        assert!(table.add(same_bucket_peer(1)));
        assert_eq!(table.len(), 3);

        let idx = bucket_index(table.node_id(), &same_bucket_peer(1).node_id);
        let bucket = table.bucket(idx).unwrap();
        assert_eq!(
            bucket.peers().last().unwrap().node_id,
            same_bucket_peer(1).node_id
        );
    }

    #[test]
    fn bucket_capacity_is_enforced() {
        let k = 4;
        let mut table = RoutingTable::new(nid([0; 20]), k);
        for low in 1..=k as u8 {
            assert!(table.add(same_bucket_peer(low)));
        }

        // Bucket is full of fresh peers; a newcomer is rejected.
        assert!(!table.add(same_bucket_peer(100)));
        assert_eq!(table.len(), k);
    }

    #[test]
    fn stale_peer_is_evicted_for_newcomer() {
        let k = 2;
        let mut table = RoutingTable::new(nid([0; 20]), k);
        table.add(same_bucket_peer(1));
        table.add(same_bucket_peer(2));

        // Age out peer 1.
        let idx = bucket_index(table.node_id(), &same_bucket_peer(1).node_id);
        table.buckets[idx].peers[0].last_seen = 0;

        assert!(table.add(same_bucket_peer(3)));
        let bucket = table.bucket(idx).unwrap();
        assert_eq!(bucket.len(), k);
        assert!(!bucket.contains(&same_bucket_peer(1).node_id));
        assert!(bucket.contains(&same_bucket_peer(3).node_id));
    }

    #[test]
    fn find_closest_returns_true_nearest() {
        let local = nid([0; 20]);
        let mut table = RoutingTable::new(local, 20);
        for low in 1..=50u8 {
            let mut id = [0u8; 20];
            id[10] = low; // spread across buckets via different high bits
            id[19] = low;
            table.add(Peer::new(nid(id), "127.0.0.1", 8468));
        }

        let mut target_bytes = [0u8; 20];
        target_bytes[10] = 25;
        target_bytes[19] = 25;
        let target = nid(target_bytes);

        let closest = table.find_closest(&target, 5);
        assert_eq!(closest.len(), 5);

        // Brute-force check against every known peer.
        let mut brute: Vec<Peer> = table.all();
        brute.sort_by_key(|p| xor_distance(&p.node_id, &target));
        for (a, b) in closest.iter().zip(brute.iter()) {
            assert_eq!(a.node_id, b.node_id);
        }
        assert_eq!(closest[0].node_id, target);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = RoutingTable::new(nid([0; 20]), 20);
        table.add(peer(1));

        table.remove(&peer(1).node_id);
        table.remove(&peer(1).node_id);
        assert!(table.is_empty());
    }

    #[test]
    fn mark_failed_increments_counter() {
        let mut table = RoutingTable::new(nid([0; 20]), 20);
        table.add(peer(1));

        table.mark_failed(&peer(1).node_id);
        table.mark_failed(&peer(1).node_id);
        assert_eq!(table.all()[0].failed_pings, 2);

        // A successful re-add resets it.
        table.add(peer(1));
        assert_eq!(table.all()[0].failed_pings, 0);
    }

    #[test]
    fn random_bucket_id_lands_in_its_bucket() {
        let table = RoutingTable::new(nid([0xA7; 20]), 20);
        for index in [0, 7, 42, 99, 158] {
            let id = table.random_id_in_bucket(index);
            assert_eq!(bucket_index(table.node_id(), &id), index);
        }
    }

    #[test]
    fn refresh_tracking_flags_idle_buckets() {
        let mut table = RoutingTable::new(nid([0; 20]), 20);
        table.add(same_bucket_peer(1));
        let idx = bucket_index(table.node_id(), &same_bucket_peer(1).node_id);

        let now = unix_now();
        assert!(table.buckets_needing_refresh(now, 3600).is_empty());
        assert_eq!(table.buckets_needing_refresh(now + 3601, 3600), vec![idx]);

        table.mark_bucket_refreshed(idx, now + 3601);
        assert!(table.buckets_needing_refresh(now + 3601, 3600).is_empty());
    }
}
