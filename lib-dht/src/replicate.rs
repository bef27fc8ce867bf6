//! Popularity-driven replication.
//!
//! Popular values get pushed back out with a long TTL until they sit on
//! enough replicas; anything already replicated widely enough is left
//! alone. Values whose bytes are no longer held locally cannot be
//! replicated and are skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lib_popularity::RankedItem;
use lib_storage::Store;
use tracing::{debug, info, warn};

use crate::engine::DhtEngine;

/// Re-replication policy and the handles to act on it.
pub struct Replicator {
    engine: Arc<DhtEngine>,
    local_store: Arc<Store>,
    /// Floor for `ensure_min_replication`.
    min_replication_factor: u32,
    /// Target replica count for popular values.
    popular_replication_factor: u32,
    default_ttl: Duration,
    popular_ttl: Duration,
}

impl Replicator {
    pub fn new(
        engine: Arc<DhtEngine>,
        local_store: Arc<Store>,
        min_replication_factor: u32,
        popular_replication_factor: u32,
        default_ttl: Duration,
        popular_ttl: Duration,
    ) -> Self {
        Self {
            engine,
            local_store,
            min_replication_factor,
            popular_replication_factor,
            default_ttl,
            popular_ttl,
        }
    }

    pub fn min_replication_factor(&self) -> u32 {
        self.min_replication_factor
    }

    /// Re-store every item at or above `threshold` that is still under the
    /// popular replication factor. Returns per-key success.
    pub async fn replicate_popular(
        &self,
        ranked_items: &[RankedItem],
        threshold: f64,
    ) -> HashMap<Vec<u8>, bool> {
        let popular: Vec<&RankedItem> = ranked_items
            .iter()
            .filter(|item| item.score >= threshold)
            .collect();
        info!(
            total_items = ranked_items.len(),
            popular_items = popular.len(),
            "starting replication pass"
        );

        let mut results = HashMap::new();
        for item in popular {
            let Some(value) = self.local_store.get(&item.key).await else {
                warn!(
                    key = %hex::encode(&item.key[..item.key.len().min(8)]),
                    "value missing locally, cannot replicate"
                );
                results.insert(item.key.clone(), false);
                continue;
            };

            if item.metrics.replication_count >= self.popular_replication_factor {
                results.insert(item.key.clone(), true);
                continue;
            }

            let ok = self
                .engine
                .store(&item.key, &value, self.popular_ttl)
                .await;
            if ok {
                debug!(
                    key = %hex::encode(&item.key[..item.key.len().min(8)]),
                    score = item.score,
                    "replicated popular item"
                );
            } else {
                warn!(
                    key = %hex::encode(&item.key[..item.key.len().min(8)]),
                    "replication failed"
                );
            }
            results.insert(item.key.clone(), ok);
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        info!(
            total = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            "replication pass complete"
        );
        results
    }

    /// Re-store the given keys with the default TTL.
    pub async fn ensure_min_replication(&self, keys: &[Vec<u8>]) -> HashMap<Vec<u8>, bool> {
        let mut results = HashMap::new();
        for key in keys {
            let Some(value) = self.local_store.get(key).await else {
                results.insert(key.clone(), false);
                continue;
            };
            let ok = self.engine.store(key, &value, self.default_ttl).await;
            results.insert(key.clone(), ok);
        }
        results
    }

    /// Immediate wide re-store, used when replica loss is detected.
    pub async fn emergency_replicate(&self, key: &[u8], value: &[u8]) -> bool {
        warn!(
            key = %hex::encode(&key[..key.len().min(8)]),
            "emergency replication"
        );
        let ok = self.engine.store(key, value, self.popular_ttl).await;
        if ok {
            info!(key = %hex::encode(&key[..key.len().min(8)]), "emergency replication succeeded");
        } else {
            warn!(key = %hex::encode(&key[..key.len().min(8)]), "emergency replication failed");
        }
        ok
    }
}
