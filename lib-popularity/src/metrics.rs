//! Per-key popularity metrics.
//!
//! A key's metrics track how often and how recently it is requested, how
//! widely it is replicated, and who asks for it. Request rate is derived
//! from a sliding window of request timestamps (capped at 1000); the
//! audience is the set of distinct requester node IDs.

use std::collections::{HashMap, HashSet, VecDeque};

use lib_crypto::NodeId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Cap on the request-timestamp window.
const REQUEST_WINDOW_CAP: usize = 1000;

/// Metrics pruned after this many days without a request.
pub const METRICS_MAX_AGE_DAYS: u64 = 30;

/// Popularity metrics for a single key.
///
/// Fields are public so the supervisor and tests can seed known states;
/// normal mutation goes through the `record_*`/`update_*` methods.
#[derive(Debug, Clone)]
pub struct KeyMetrics {
    /// Total requests observed.
    pub request_count: u64,
    /// Requests per hour over the sliding window.
    pub request_rate: f64,
    /// Highest replica count observed for this key.
    pub replication_count: u32,
    /// 1.0 = fresh, decays toward 0.1 with age.
    pub freshness_score: f64,
    /// Distinct requesters observed (may exceed `requesting_nodes.len()`
    /// when seeded from a peer's snapshot).
    pub audience_size: u32,
    /// Replies, citations, mentions. No wire-level source of its own;
    /// contributes zero unless fed explicitly.
    pub social_engagements: u64,
    /// Fraction of seed nodes holding the value, in [0, 1].
    pub seed_coverage: f64,
    /// When this key's metrics were first created (unix seconds).
    pub first_seen: f64,
    /// Last request time (unix seconds).
    pub last_request: f64,
    /// Creation time of the underlying value, when known.
    pub created_at: Option<f64>,

    /// Sliding window of request timestamps, oldest first.
    pub request_timestamps: VecDeque<f64>,
    /// Distinct requester IDs seen locally.
    pub requesting_nodes: HashSet<NodeId>,
}

impl KeyMetrics {
    pub fn new(now: f64) -> Self {
        Self {
            request_count: 0,
            request_rate: 0.0,
            replication_count: 1,
            freshness_score: 1.0,
            audience_size: 1,
            social_engagements: 0,
            seed_coverage: 0.0,
            first_seen: now,
            last_request: now,
            created_at: None,
            request_timestamps: VecDeque::new(),
            requesting_nodes: HashSet::new(),
        }
    }

    /// Record one request and recompute the request rate.
    pub fn record_request(&mut self, requester: Option<&NodeId>, now: f64) {
        self.request_count += 1;
        self.last_request = now;

        if self.request_timestamps.len() == REQUEST_WINDOW_CAP {
            self.request_timestamps.pop_front();
        }
        self.request_timestamps.push_back(now);

        if let Some(id) = requester {
            self.requesting_nodes.insert(*id);
            self.audience_size = self.audience_size.max(self.requesting_nodes.len() as u32);
        }

        self.recompute_rate();
    }

    fn recompute_rate(&mut self) {
        let n = self.request_timestamps.len();
        match (self.request_timestamps.front(), self.request_timestamps.back()) {
            (Some(first), Some(last)) if n > 1 => {
                let span = last - first;
                self.request_rate = if span > 0.0 {
                    (n as f64 / span) * 3600.0
                } else {
                    n as f64 * 3600.0
                };
            }
            _ => {
                self.request_rate = if self.request_count > 0 { 1.0 } else { 0.0 };
            }
        }
    }

    /// Recompute the freshness score from the value's age.
    ///
    /// Fresh for the first hour, then linear decay to 0.5 over the first
    /// day, then exponential decay halving every 7 days with a 0.1 floor.
    pub fn update_freshness(&mut self, now: f64) {
        let age = now - self.created_at.unwrap_or(self.first_seen);

        self.freshness_score = if age < 3600.0 {
            1.0
        } else if age < 86400.0 {
            1.0 - (age / 86400.0) * 0.5
        } else {
            let days = age / 86400.0;
            (0.5 * 0.5_f64.powf(days / 7.0)).max(0.1)
        };
    }

    /// Max-merge an observed replica count.
    pub fn update_replication(&mut self, count: u32) {
        self.replication_count = self.replication_count.max(count);
    }

    pub fn add_social_engagements(&mut self, count: u64) {
        self.social_engagements += count;
    }

    /// Wire-friendly snapshot (no requester set, just its size).
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count,
            request_rate: self.request_rate,
            replication_count: self.replication_count,
            freshness_score: self.freshness_score,
            audience_size: self.audience_size,
            social_engagements: self.social_engagements,
            seed_coverage: self.seed_coverage,
            first_seen: self.first_seen,
            last_request: self.last_request,
            created_at: self.created_at,
        }
    }

    /// Rebuild metrics from a peer's snapshot. The requester set starts
    /// empty; the snapshot's audience size is kept as a floor.
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        Self {
            request_count: snapshot.request_count,
            request_rate: snapshot.request_rate,
            replication_count: snapshot.replication_count,
            freshness_score: snapshot.freshness_score,
            audience_size: snapshot.audience_size,
            social_engagements: snapshot.social_engagements,
            seed_coverage: snapshot.seed_coverage,
            first_seen: snapshot.first_seen,
            last_request: snapshot.last_request,
            created_at: snapshot.created_at,
            request_timestamps: VecDeque::new(),
            requesting_nodes: HashSet::new(),
        }
    }
}

/// Serializable metrics snapshot exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub request_rate: f64,
    pub replication_count: u32,
    pub freshness_score: f64,
    pub audience_size: u32,
    pub social_engagements: u64,
    pub seed_coverage: f64,
    pub first_seen: f64,
    pub last_request: f64,
    pub created_at: Option<f64>,
}

/// Collector holding metrics for every locally observed key.
///
/// Metrics are created lazily on the first touching event per key and
/// pruned once idle for 30 days.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: HashMap<Vec<u8>, KeyMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a FIND_VALUE for `key`, optionally crediting the requester.
    pub fn record_find_value(&mut self, key: &[u8], requester: Option<&NodeId>, now: f64) {
        let metrics = self
            .metrics
            .entry(key.to_vec())
            .or_insert_with(|| KeyMetrics::new(now));
        metrics.record_request(requester, now);
        metrics.update_freshness(now);
        debug!(key = %hex_prefix(key), "recorded FIND_VALUE");
    }

    /// Record a STORE with the replica count it achieved.
    pub fn record_store(&mut self, key: &[u8], replication_count: u32, now: f64) {
        let metrics = self
            .metrics
            .entry(key.to_vec())
            .or_insert_with(|| KeyMetrics::new(now));
        metrics.update_replication(replication_count);
        metrics.update_freshness(now);
        debug!(key = %hex_prefix(key), replication_count, "recorded STORE");
    }

    pub fn record_social_engagement(&mut self, key: &[u8], count: u64, now: f64) {
        let metrics = self
            .metrics
            .entry(key.to_vec())
            .or_insert_with(|| KeyMetrics::new(now));
        metrics.add_social_engagements(count);
    }

    /// Merge a snapshot received from a peer: known keys max-merge the
    /// replica count, unknown keys are seeded from the snapshot.
    pub fn merge_remote(&mut self, key: &[u8], snapshot: &MetricsSnapshot) {
        match self.metrics.get_mut(key) {
            Some(existing) => existing.update_replication(snapshot.replication_count),
            None => {
                self.metrics
                    .insert(key.to_vec(), KeyMetrics::from_snapshot(snapshot));
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&KeyMetrics> {
        self.metrics.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut KeyMetrics> {
        self.metrics.get_mut(key)
    }

    /// Insert or replace a key's metrics wholesale. Test and supervisor
    /// seam for seeding known states.
    pub fn insert(&mut self, key: Vec<u8>, metrics: KeyMetrics) {
        self.metrics.insert(key, metrics);
    }

    pub fn all(&self) -> &HashMap<Vec<u8>, KeyMetrics> {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn update_all_freshness(&mut self, now: f64) {
        for metrics in self.metrics.values_mut() {
            metrics.update_freshness(now);
        }
    }

    /// Drop metrics idle for longer than `max_age_days`. Returns the count
    /// removed.
    pub fn cleanup_old(&mut self, now: f64, max_age_days: u64) -> usize {
        let max_age = max_age_days as f64 * 86400.0;
        let before = self.metrics.len();
        self.metrics.retain(|_, m| now - m.last_request <= max_age);
        let removed = before - self.metrics.len();
        if removed > 0 {
            info!(count = removed, "pruned stale metrics");
        }
        removed
    }
}

fn hex_prefix(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::NodeId;

    fn nid(b: u8) -> NodeId {
        NodeId::from_bytes([b; 20])
    }

    #[test]
    fn request_rate_from_window() {
        let mut m = KeyMetrics::new(0.0);
        // 10 requests spread over 30 minutes -> 20/hour
        for i in 0..10 {
            m.record_request(None, i as f64 * 200.0);
        }
        assert_eq!(m.request_count, 10);
        let span = 9.0 * 200.0;
        let expected = 10.0 / span * 3600.0;
        assert!((m.request_rate - expected).abs() < 1e-9);
    }

    #[test]
    fn single_request_rate_is_one() {
        let mut m = KeyMetrics::new(0.0);
        m.record_request(None, 1.0);
        assert_eq!(m.request_rate, 1.0);
    }

    #[test]
    fn window_is_capped() {
        let mut m = KeyMetrics::new(0.0);
        for i in 0..1500 {
            m.record_request(None, i as f64);
        }
        assert_eq!(m.request_timestamps.len(), 1000);
        assert_eq!(m.request_count, 1500);
    }

    #[test]
    fn audience_counts_distinct_requesters() {
        let mut m = KeyMetrics::new(0.0);
        m.record_request(Some(&nid(1)), 1.0);
        m.record_request(Some(&nid(1)), 2.0);
        m.record_request(Some(&nid(2)), 3.0);
        assert_eq!(m.audience_size, 2);
    }

    #[test]
    fn freshness_is_nonincreasing_in_age() {
        let mut m = KeyMetrics::new(0.0);
        let mut last = f64::INFINITY;
        for age in [0.0, 1800.0, 3599.0, 3601.0, 43200.0, 86400.0, 7.0 * 86400.0, 60.0 * 86400.0]
        {
            m.update_freshness(age);
            assert!(m.freshness_score <= last, "freshness rose at age {age}");
            assert!((0.0..=1.0).contains(&m.freshness_score));
            last = m.freshness_score;
        }
        // floor
        m.update_freshness(1000.0 * 86400.0);
        assert!((m.freshness_score - 0.1).abs() < 1e-12);
    }

    #[test]
    fn freshness_piecewise_values() {
        let mut m = KeyMetrics::new(0.0);
        m.update_freshness(1800.0);
        assert_eq!(m.freshness_score, 1.0);
        m.update_freshness(43200.0); // half a day
        assert!((m.freshness_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn replication_is_max_merged() {
        let mut c = MetricsCollector::new();
        c.record_store(b"k", 5, 0.0);
        c.record_store(b"k", 3, 1.0);
        assert_eq!(c.get(b"k").unwrap().replication_count, 5);
    }

    #[test]
    fn merge_remote_inserts_or_maxes() {
        let mut c = MetricsCollector::new();
        let mut remote = KeyMetrics::new(0.0);
        remote.update_replication(8);
        let snap = remote.snapshot();

        c.merge_remote(b"new", &snap);
        assert_eq!(c.get(b"new").unwrap().replication_count, 8);

        c.record_store(b"known", 12, 0.0);
        c.merge_remote(b"known", &snap);
        assert_eq!(c.get(b"known").unwrap().replication_count, 12);
    }

    #[test]
    fn cleanup_drops_idle_metrics() {
        let mut c = MetricsCollector::new();
        c.record_find_value(b"old", None, 0.0);
        c.record_find_value(b"new", None, 40.0 * 86400.0);

        let removed = c.cleanup_old(40.0 * 86400.0 + 1.0, METRICS_MAX_AGE_DAYS);
        assert_eq!(removed, 1);
        assert!(c.get(b"old").is_none());
        assert!(c.get(b"new").is_some());
    }
}
