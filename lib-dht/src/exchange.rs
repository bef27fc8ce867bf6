//! Popularity exchange between peers.
//!
//! Two mechanisms live here:
//!
//! - Neighbor gossip: every exchange interval a node sends its local top-N
//!   ranked keys to a handful of neighbors and merges what comes back.
//!   Known keys max-merge the replica count, unknown keys are seeded from
//!   the received metrics snapshot.
//! - Seed consensus: long-lived seed nodes collect rankings from other
//!   seeds and publish a consensus top-100, scoring each key by the median
//!   of all observations. The median (lower-middle on even counts) keeps a
//!   single inflated score from dragging a key up the ranking.

use std::collections::HashMap;
use std::sync::Arc;

use lib_popularity::{MetricsCollector, MetricsSnapshot, PopularityRanker, RankedItem};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::peer::{unix_now_f64, Peer};
use crate::protocol::NetworkProtocol;
use crate::wire::ExchangeItem;

/// Neighbors contacted per gossip round.
const MAX_EXCHANGE_NEIGHBORS: usize = 5;
/// Seed nodes queried per consensus round.
const MAX_SEED_QUERIES: usize = 10;
/// Size of the published consensus ranking.
const GLOBAL_RANKING_SIZE: usize = 100;

#[derive(Debug, Default)]
struct GlobalRanking {
    items: Vec<ExchangeItem>,
    updated_at: f64,
}

/// Gossips local popularity data and aggregates the global ranking.
pub struct PopularityExchanger {
    metrics: Arc<Mutex<MetricsCollector>>,
    ranker: PopularityRanker,
    protocol: Arc<NetworkProtocol>,
    global_ranking: RwLock<GlobalRanking>,
}

impl PopularityExchanger {
    pub fn new(
        metrics: Arc<Mutex<MetricsCollector>>,
        ranker: PopularityRanker,
        protocol: Arc<NetworkProtocol>,
    ) -> Self {
        Self {
            metrics,
            ranker,
            protocol,
            global_ranking: RwLock::new(GlobalRanking::default()),
        }
    }

    pub fn ranker(&self) -> &PopularityRanker {
        &self.ranker
    }

    /// The local top-N ranking in wire form.
    pub async fn local_top_items(&self, top_n: usize, now: f64) -> Vec<ExchangeItem> {
        let metrics = self.metrics.lock().await;
        self.ranker
            .rank_items(metrics.all(), now, Some(top_n))
            .into_iter()
            .map(to_exchange_item)
            .collect()
    }

    /// One gossip round: push the local top-N to up to five neighbors and
    /// fold their rankings back in. Returns the number of items received.
    pub async fn exchange_top_items(&self, neighbors: &[Peer], top_n: usize) -> usize {
        if neighbors.is_empty() {
            return 0;
        }
        let now = unix_now_f64();
        let items = self.local_top_items(top_n, now).await;

        let targets = &neighbors[..neighbors.len().min(MAX_EXCHANGE_NEIGHBORS)];
        let replies = futures::future::join_all(
            targets
                .iter()
                .map(|peer| self.protocol.exchange_popularity(items.clone(), peer)),
        )
        .await;

        let mut received = 0usize;
        for reply in replies {
            match reply {
                Ok(remote_items) => {
                    received += remote_items.len();
                    self.process_received_items(&remote_items).await;
                }
                Err(e) => debug!(error = %e, "popularity exchange failed"),
            }
        }

        info!(
            local_items = items.len(),
            neighbors = targets.len(),
            received,
            "exchanged popularity data"
        );
        received
    }

    /// Merge items received from a peer into the local metrics.
    pub async fn process_received_items(&self, items: &[ExchangeItem]) {
        let mut metrics = self.metrics.lock().await;
        for item in items {
            match hex::decode(&item.key) {
                Ok(key) => metrics.merge_remote(&key, &item.metrics),
                Err(e) => warn!(key = %item.key, error = %e, "ignoring malformed exchange key"),
            }
        }
    }

    /// Seed-only: aggregate a consensus ranking from the local top-100 and
    /// up to ten other seed nodes, cache it, and return it.
    pub async fn aggregate_global_ranking(
        &self,
        seed_nodes: &[Peer],
        now: f64,
    ) -> Vec<ExchangeItem> {
        // key -> (observed scores, first snapshot seen; local wins)
        let mut observed: HashMap<Vec<u8>, (Vec<f64>, MetricsSnapshot)> = HashMap::new();

        for item in self.local_top_items(GLOBAL_RANKING_SIZE, now).await {
            if let Ok(key) = hex::decode(&item.key) {
                observed
                    .entry(key)
                    .or_insert_with(|| (Vec::new(), item.metrics.clone()))
                    .0
                    .push(item.score);
            }
        }

        let targets = &seed_nodes[..seed_nodes.len().min(MAX_SEED_QUERIES)];
        let replies = futures::future::join_all(
            targets
                .iter()
                .map(|peer| self.protocol.request_global_ranking(peer)),
        )
        .await;

        for reply in replies {
            let items = match reply {
                Ok(items) => items,
                Err(e) => {
                    debug!(error = %e, "global ranking query failed");
                    continue;
                }
            };
            for item in items {
                if let Ok(key) = hex::decode(&item.key) {
                    observed
                        .entry(key)
                        .or_insert_with(|| (Vec::new(), item.metrics.clone()))
                        .0
                        .push(item.score);
                }
            }
        }

        let mut consensus: Vec<ExchangeItem> = observed
            .into_iter()
            .map(|(key, (scores, metrics))| ExchangeItem {
                key: hex::encode(key),
                score: consensus_score(scores),
                metrics,
            })
            .collect();
        consensus.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.metrics.last_request.total_cmp(&a.metrics.last_request))
                .then(a.key.cmp(&b.key))
        });
        consensus.truncate(GLOBAL_RANKING_SIZE);

        {
            let mut cache = self.global_ranking.write().await;
            cache.items = consensus.clone();
            cache.updated_at = now;
        }

        info!(
            seed_nodes = targets.len(),
            consensus_items = consensus.len(),
            "aggregated global ranking"
        );
        consensus
    }

    /// The cached consensus ranking, served to GLOBAL_RANKING_REQ.
    pub async fn cached_global_ranking(&self) -> Vec<ExchangeItem> {
        self.global_ranking.read().await.items.clone()
    }

    /// When the cached consensus was last rebuilt (unix seconds; 0.0 when
    /// never).
    pub async fn global_ranking_age(&self) -> f64 {
        self.global_ranking.read().await.updated_at
    }
}

fn to_exchange_item(item: RankedItem) -> ExchangeItem {
    ExchangeItem {
        key: hex::encode(&item.key),
        score: item.score,
        metrics: item.metrics,
    }
}

/// Median of the observed scores, taking the lower-middle element on even
/// counts. Empty input scores zero.
pub fn consensus_score(mut scores: Vec<f64>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.sort_by(f64::total_cmp);
    scores[(scores.len() - 1) / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_is_median_with_lower_middle_tiebreak() {
        // A seed with local score 7 and remote observations 3, 8, 9.
        assert_eq!(consensus_score(vec![3.0, 8.0, 9.0, 7.0]), 7.0);

        assert_eq!(consensus_score(vec![5.0]), 5.0);
        assert_eq!(consensus_score(vec![2.0, 4.0]), 2.0);
        assert_eq!(consensus_score(vec![1.0, 5.0, 9.0]), 5.0);
        assert_eq!(consensus_score(Vec::new()), 0.0);
    }

    #[test]
    fn consensus_resists_outliers() {
        // One wildly inflated score does not drag the consensus up.
        assert_eq!(consensus_score(vec![2.0, 2.5, 3.0, 10.0]), 2.5);
    }
}
