//! Iterative DHT operations: FIND_NODE, FIND_VALUE, STORE.
//!
//! Lookups follow the standard Kademlia shape: keep a shortlist of the α
//! closest known peers to the target, query up to α of them in parallel,
//! fold any peers they return back into the candidate set, re-sort, and
//! stop once every known candidate has been queried. Peers that time out
//! simply contribute nothing to the next round.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lib_crypto::NodeId;
use lib_popularity::MetricsCollector;
use lib_storage::Store;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::distance::{target_for_key, xor_distance};
use crate::error::DhtError;
use crate::peer::{unix_now_f64, Peer};
use crate::protocol::NetworkProtocol;
use crate::routing::RoutingTable;

/// The lookup/store engine of one node.
pub struct DhtEngine {
    node_id: NodeId,
    alpha: usize,
    k: usize,
    routing: Arc<RwLock<RoutingTable>>,
    local_store: Arc<Store>,
    metrics: Arc<Mutex<MetricsCollector>>,
    protocol: Arc<NetworkProtocol>,
}

impl DhtEngine {
    pub fn new(
        node_id: NodeId,
        alpha: usize,
        k: usize,
        routing: Arc<RwLock<RoutingTable>>,
        local_store: Arc<Store>,
        metrics: Arc<Mutex<MetricsCollector>>,
        protocol: Arc<NetworkProtocol>,
    ) -> Self {
        Self {
            node_id,
            alpha,
            k,
            routing,
            local_store,
            metrics,
            protocol,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Store a value locally and on the k peers closest to the key.
    ///
    /// Returns true when the local put succeeded or at least one remote
    /// peer acknowledged the STORE. Remote failures are absorbed.
    pub async fn store(&self, key: &[u8], value: &[u8], ttl: Duration) -> bool {
        let local_ok = match self.local_store.put(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "local put failed");
                false
            }
        };

        let target = target_for_key(key);
        let mut closest = self.find_node(&target).await;
        if closest.is_empty() {
            closest = self.routing.read().await.find_closest(&target, self.k);
        }

        let mut remote_ok = 0usize;
        if !closest.is_empty() {
            let ttl_secs = ttl.as_secs();
            let attempts: Vec<_> = closest
                .iter()
                .take(self.k)
                .map(|peer| self.protocol.store(key, value, ttl_secs, peer))
                .collect();
            let results = join_all(attempts).await;
            remote_ok = results.into_iter().filter(|ok| *ok).count();
            debug!(
                key = %hex::encode(&key[..key.len().min(8)]),
                attempted = closest.len().min(self.k),
                succeeded = remote_ok,
                "STORE fan-out complete"
            );
        }

        let result = local_ok || remote_ok > 0;
        let replication = if result { self.k as u32 } else { 1 };
        self.metrics
            .lock()
            .await
            .record_store(key, replication, unix_now_f64());
        result
    }

    /// Retrieve a value: local store first, then an iterative network
    /// lookup toward the key's target ID.
    pub async fn find_value(&self, key: &[u8]) -> Result<Vec<u8>, DhtError> {
        self.metrics
            .lock()
            .await
            .record_find_value(key, Some(&self.node_id), unix_now_f64());

        if let Some(value) = self.local_store.get(key).await {
            return Ok(value);
        }

        let target = target_for_key(key);
        let mut seen = self.initial_candidates(&target).await;
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut shortlist = closest_of(&seen, &target, self.alpha);

        loop {
            let candidates: Vec<Peer> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.node_id))
                .take(self.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let replies = join_all(
                candidates
                    .iter()
                    .map(|peer| self.protocol.find_value(key, peer)),
            )
            .await;

            for reply in &replies {
                if let Some(value) = &reply.value {
                    return Ok(value.clone());
                }
            }
            for reply in replies {
                self.merge_candidates(&mut seen, reply.nodes);
            }

            // No value anywhere in this round; widen the horizon through
            // FIND_NODE on the same candidates.
            let expansions = join_all(
                candidates
                    .iter()
                    .map(|peer| self.protocol.find_node(&target, peer)),
            )
            .await;
            for nodes in expansions {
                self.merge_candidates(&mut seen, nodes);
            }

            for peer in &candidates {
                queried.insert(peer.node_id);
            }
            shortlist = closest_of(&seen, &target, self.alpha);

            if seen.keys().all(|id| queried.contains(id)) {
                break;
            }
        }

        Err(DhtError::ValueNotFound {
            key: hex::encode(&key[..key.len().min(20)]),
        })
    }

    /// Iterative node lookup; returns the α closest peers from the
    /// converged candidate set.
    pub async fn find_node(&self, target: &NodeId) -> Vec<Peer> {
        let mut seen = self.initial_candidates(target).await;
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut shortlist = closest_of(&seen, target, self.alpha);

        loop {
            let candidates: Vec<Peer> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.node_id))
                .take(self.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let replies = join_all(
                candidates
                    .iter()
                    .map(|peer| self.protocol.find_node(target, peer)),
            )
            .await;
            for nodes in replies {
                self.merge_candidates(&mut seen, nodes);
            }

            for peer in &candidates {
                queried.insert(peer.node_id);
            }
            shortlist = closest_of(&seen, target, self.alpha);

            if seen.keys().all(|id| queried.contains(id)) {
                break;
            }
        }

        closest_of(&seen, target, self.alpha)
    }

    async fn initial_candidates(&self, target: &NodeId) -> HashMap<NodeId, Peer> {
        self.routing
            .read()
            .await
            .find_closest(target, self.alpha)
            .into_iter()
            .map(|p| (p.node_id, p))
            .collect()
    }

    fn merge_candidates(&self, seen: &mut HashMap<NodeId, Peer>, peers: Vec<Peer>) {
        for peer in peers {
            if peer.node_id == self.node_id || peer.node_id.is_zero() {
                continue;
            }
            seen.entry(peer.node_id).or_insert(peer);
        }
    }
}

fn closest_of(seen: &HashMap<NodeId, Peer>, target: &NodeId, count: usize) -> Vec<Peer> {
    let mut peers: Vec<Peer> = seen.values().cloned().collect();
    peers.sort_by_key(|p| xor_distance(&p.node_id, target));
    peers.truncate(count);
    peers
}
