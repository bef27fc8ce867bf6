//! Popularity scoring and ranking.
//!
//! Each metric is normalized into [0, 1] against a fixed cap, combined with
//! weights that shift as the value ages (fresh values lean on freshness,
//! week-old values on social signals, older values on seed coverage), and
//! scaled to a [0, 10] score. Two thresholds drive the rest of the system:
//! popular (default 7.0) and active (default 5.0).

use std::collections::HashMap;

use crate::metrics::{KeyMetrics, MetricsSnapshot};

/// Normalization caps: a metric at or above its cap contributes 1.0.
const RATE_CAP: f64 = 100.0;
const REPLICATION_CAP: f64 = 20.0;
const AUDIENCE_CAP: f64 = 50.0;
const SOCIAL_CAP: f64 = 100.0;

/// Feature weights. Every weight set sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub request_rate: f64,
    pub replication: f64,
    pub freshness: f64,
    pub audience: f64,
    pub social: f64,
    pub seed_coverage: f64,
}

impl Weights {
    /// Weights used when age adaptation is disabled.
    pub const DEFAULT: Weights = Weights {
        request_rate: 0.25,
        replication: 0.20,
        freshness: 0.15,
        audience: 0.10,
        social: 0.20,
        seed_coverage: 0.10,
    };

    /// Age-adaptive weights keyed on how old the value is.
    pub fn for_age(age_seconds: f64) -> Weights {
        if age_seconds < 86400.0 {
            // Under a day: freshness dominates.
            Weights {
                request_rate: 0.25,
                replication: 0.20,
                freshness: 0.30,
                audience: 0.10,
                social: 0.10,
                seed_coverage: 0.05,
            }
        } else if age_seconds < 604800.0 {
            // Under a week: social signals dominate.
            Weights {
                request_rate: 0.25,
                replication: 0.20,
                freshness: 0.10,
                audience: 0.10,
                social: 0.30,
                seed_coverage: 0.05,
            }
        } else {
            // A week and older: durability (seed coverage) dominates.
            Weights {
                request_rate: 0.25,
                replication: 0.20,
                freshness: 0.05,
                audience: 0.10,
                social: 0.15,
                seed_coverage: 0.25,
            }
        }
    }

    pub fn sum(&self) -> f64 {
        self.request_rate
            + self.replication
            + self.freshness
            + self.audience
            + self.social
            + self.seed_coverage
    }
}

/// A key with its computed score, ordered most popular first.
#[derive(Debug, Clone)]
pub struct RankedItem {
    pub key: Vec<u8>,
    pub score: f64,
    pub metrics: MetricsSnapshot,
}

/// Scores and ranks keys from their metrics.
#[derive(Debug, Clone)]
pub struct PopularityRanker {
    pub popularity_threshold: f64,
    pub active_threshold: f64,
}

impl Default for PopularityRanker {
    fn default() -> Self {
        Self {
            popularity_threshold: 7.0,
            active_threshold: 5.0,
        }
    }
}

impl PopularityRanker {
    pub fn new(popularity_threshold: f64, active_threshold: f64) -> Self {
        Self {
            popularity_threshold,
            active_threshold,
        }
    }

    /// Popularity score in [0, 10] with age-adaptive weights.
    pub fn score(&self, metrics: &KeyMetrics, now: f64) -> f64 {
        self.score_with_weights(metrics, Weights::for_age(now - metrics.first_seen))
    }

    /// Score with a fixed weight set.
    pub fn score_with_weights(&self, metrics: &KeyMetrics, weights: Weights) -> f64 {
        let rate = (metrics.request_rate / RATE_CAP).min(1.0);
        let replication = (metrics.replication_count as f64 / REPLICATION_CAP).min(1.0);
        let freshness = metrics.freshness_score.clamp(0.0, 1.0);
        let audience = (metrics.audience_size as f64 / AUDIENCE_CAP).min(1.0);
        let social = (metrics.social_engagements as f64 / SOCIAL_CAP).min(1.0);
        let seed = metrics.seed_coverage.clamp(0.0, 1.0);

        let score = (rate * weights.request_rate
            + replication * weights.replication
            + freshness * weights.freshness
            + audience * weights.audience
            + social * weights.social
            + seed * weights.seed_coverage)
            * 10.0;

        score.clamp(0.0, 10.0)
    }

    /// Rank all keys by descending score.
    ///
    /// Ties break on more recent `last_request`, then ascending key bytes,
    /// so repeated rankings over the same metrics are stable.
    pub fn rank_items(
        &self,
        metrics: &HashMap<Vec<u8>, KeyMetrics>,
        now: f64,
        limit: Option<usize>,
    ) -> Vec<RankedItem> {
        let mut ranked: Vec<RankedItem> = metrics
            .iter()
            .map(|(key, m)| RankedItem {
                key: key.clone(),
                score: self.score(m, now),
                metrics: m.snapshot(),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.metrics.last_request.total_cmp(&a.metrics.last_request))
                .then(a.key.cmp(&b.key))
        });

        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        ranked
    }

    /// Keys scoring at or above the popularity threshold.
    pub fn popular_items(
        &self,
        metrics: &HashMap<Vec<u8>, KeyMetrics>,
        now: f64,
        limit: usize,
    ) -> Vec<RankedItem> {
        let mut items = self.rank_items(metrics, now, None);
        items.retain(|i| i.score >= self.popularity_threshold);
        items.truncate(limit);
        items
    }

    /// Keys scoring at or above the active threshold.
    pub fn active_items(
        &self,
        metrics: &HashMap<Vec<u8>, KeyMetrics>,
        now: f64,
        limit: usize,
    ) -> Vec<RankedItem> {
        let mut items = self.rank_items(metrics, now, None);
        items.retain(|i| i.score >= self.active_threshold);
        items.truncate(limit);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::NodeId;

    fn hot_metrics(now: f64) -> KeyMetrics {
        let mut m = KeyMetrics::new(now - 7200.0);
        for i in 0..60 {
            let requester = NodeId::from_bytes([i as u8 + 1; 20]);
            m.record_request(Some(&requester), now - 60.0 + i as f64);
        }
        m.update_replication(12);
        m.update_freshness(now);
        m
    }

    #[test]
    fn all_weight_sets_sum_to_one() {
        for age in [0.0, 3600.0, 100000.0, 700000.0] {
            assert!((Weights::for_age(age).sum() - 1.0).abs() < 1e-12);
        }
        assert!((Weights::DEFAULT.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn score_is_bounded() {
        let ranker = PopularityRanker::default();
        let now = 1_000_000.0;

        let empty = KeyMetrics::new(now);
        let score = ranker.score(&empty, now);
        assert!((0.0..=10.0).contains(&score));

        // Saturate everything.
        let mut maxed = KeyMetrics::new(now);
        maxed.request_rate = 1.0e9;
        maxed.replication_count = 1000;
        maxed.audience_size = 10_000;
        maxed.social_engagements = 1_000_000;
        maxed.seed_coverage = 1.0;
        maxed.freshness_score = 1.0;
        let score = ranker.score(&maxed, now);
        assert!(score <= 10.0);
        assert!((score - 10.0).abs() < 1e-9);
    }

    #[test]
    fn heavily_requested_recent_key_is_popular() {
        let ranker = PopularityRanker::default();
        let now = 1_000_000.0;
        let m = hot_metrics(now);

        let score = ranker.score(&m, now);
        assert!(score >= 7.0, "expected popular score, got {score}");
    }

    #[test]
    fn ranking_is_nonincreasing() {
        let ranker = PopularityRanker::default();
        let now = 1_000_000.0;

        let mut all = HashMap::new();
        all.insert(b"hot".to_vec(), hot_metrics(now));
        all.insert(b"cold".to_vec(), KeyMetrics::new(now - 86400.0 * 10.0));
        let mut warm = KeyMetrics::new(now - 3600.0);
        warm.record_request(None, now - 60.0);
        warm.update_freshness(now);
        all.insert(b"warm".to_vec(), warm);

        let ranked = ranker.rank_items(&all, now, None);
        assert_eq!(ranked.len(), 3);
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(ranked[0].key, b"hot".to_vec());
    }

    #[test]
    fn ties_break_on_last_request_then_key() {
        let ranker = PopularityRanker::default();
        let now = 1_000_000.0;

        let mut a = KeyMetrics::new(now);
        a.last_request = now - 100.0;
        let mut b = KeyMetrics::new(now);
        b.last_request = now;
        let mut c = KeyMetrics::new(now);
        c.last_request = now;

        let mut all = HashMap::new();
        all.insert(b"a".to_vec(), a);
        all.insert(b"c".to_vec(), c);
        all.insert(b"b".to_vec(), b);

        let ranked = ranker.rank_items(&all, now, None);
        // b and c share last_request, so they order by key; a is last.
        assert_eq!(ranked[0].key, b"b".to_vec());
        assert_eq!(ranked[1].key, b"c".to_vec());
        assert_eq!(ranked[2].key, b"a".to_vec());
    }

    #[test]
    fn age_shifts_weight_toward_seed_coverage() {
        let ranker = PopularityRanker::default();
        let now = 1_000_000.0;

        let mut old = KeyMetrics::new(now - 30.0 * 86400.0);
        old.seed_coverage = 1.0;
        old.update_freshness(now);
        let mut young = KeyMetrics::new(now - 60.0);
        young.seed_coverage = 1.0;
        young.update_freshness(now);

        // The old bucket weights seed coverage at 0.25, the young at 0.05.
        let old_seed_part = ranker.score(&old, now);
        let young_without_freshness = ranker.score_with_weights(
            &KeyMetrics {
                freshness_score: 0.0,
                ..young.clone()
            },
            Weights::for_age(60.0),
        );
        assert!(old_seed_part > young_without_freshness);
    }

    #[test]
    fn thresholds_filter_items() {
        let ranker = PopularityRanker::default();
        let now = 1_000_000.0;

        let mut all = HashMap::new();
        all.insert(b"hot".to_vec(), hot_metrics(now));
        all.insert(b"cold".to_vec(), KeyMetrics::new(now - 86400.0 * 20.0));

        let popular = ranker.popular_items(&all, now, 100);
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].key, b"hot".to_vec());

        let active = ranker.active_items(&all, now, 100);
        assert!(active.iter().all(|i| i.score >= 5.0));
    }
}
