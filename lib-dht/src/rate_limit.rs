//! Inbound rate limiting.
//!
//! Two sliding windows guard the node: a global one across all senders and
//! a per-sender one keyed by node ID. Breaching either drops the datagram;
//! no response is emitted, so abusive senders learn nothing.

use std::collections::{HashMap, VecDeque};

use lib_crypto::NodeId;

/// Rate limiter statistics, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub recent_requests: usize,
    pub max_requests: usize,
    pub active_senders: usize,
}

/// Sliding-window limiter with a global and a per-sender cap.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window_secs: f64,
    per_node_limit: usize,
    history: VecDeque<f64>,
    node_history: HashMap<NodeId, VecDeque<f64>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_secs: u64, per_node_limit: usize) -> Self {
        Self {
            max_requests,
            window_secs: window_secs as f64,
            per_node_limit,
            history: VecDeque::new(),
            node_history: HashMap::new(),
        }
    }

    /// Check whether one more message from `sender` is allowed at `now`
    /// (unix seconds) and record it if so.
    pub fn check(&mut self, sender: Option<&NodeId>, now: f64) -> bool {
        self.evict_old(now);

        if self.history.len() >= self.max_requests {
            return false;
        }
        if let Some(id) = sender {
            let seen = self.node_history.get(id).map_or(0, VecDeque::len);
            if seen >= self.per_node_limit {
                return false;
            }
        }

        self.history.push_back(now);
        if let Some(id) = sender {
            self.node_history.entry(*id).or_default().push_back(now);
        }
        true
    }

    fn evict_old(&mut self, now: f64) {
        let cutoff = now - self.window_secs;
        while self.history.front().is_some_and(|t| *t <= cutoff) {
            self.history.pop_front();
        }
        self.node_history.retain(|_, times| {
            while times.front().is_some_and(|t| *t <= cutoff) {
                times.pop_front();
            }
            !times.is_empty()
        });
    }

    pub fn stats(&mut self, now: f64) -> RateLimiterStats {
        self.evict_old(now);
        RateLimiterStats {
            recent_requests: self.history.len(),
            max_requests: self.max_requests,
            active_senders: self.node_history.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(b: u8) -> NodeId {
        NodeId::from_bytes([b; 20])
    }

    #[test]
    fn per_sender_limit_drops_excess() {
        let mut limiter = RateLimiter::new(100, 60, 20);
        let sender = nid(1);

        let mut allowed = 0;
        let mut dropped = 0;
        for i in 0..25 {
            if limiter.check(Some(&sender), 1000.0 + i as f64) {
                allowed += 1;
            } else {
                dropped += 1;
            }
        }
        assert_eq!(allowed, 20);
        assert_eq!(dropped, 5);
    }

    #[test]
    fn global_limit_spans_senders() {
        let mut limiter = RateLimiter::new(10, 60, 20);

        let mut allowed = 0;
        for i in 0..15u8 {
            if limiter.check(Some(&nid(i)), 1000.0) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn window_expiry_frees_budget() {
        let mut limiter = RateLimiter::new(100, 60, 2);
        let sender = nid(1);

        assert!(limiter.check(Some(&sender), 1000.0));
        assert!(limiter.check(Some(&sender), 1001.0));
        assert!(!limiter.check(Some(&sender), 1002.0));

        // Both earlier messages fall out of the window.
        assert!(limiter.check(Some(&sender), 1070.0));
    }

    #[test]
    fn recent_count_never_exceeds_max() {
        let mut limiter = RateLimiter::new(5, 60, 5);
        for i in 0..50u8 {
            limiter.check(Some(&nid(i % 3)), 1000.0 + i as f64);
            let stats = limiter.stats(1000.0 + i as f64);
            assert!(stats.recent_requests <= stats.max_requests);
        }
    }

    #[test]
    fn anonymous_messages_count_globally() {
        let mut limiter = RateLimiter::new(3, 60, 2);
        assert!(limiter.check(None, 1.0));
        assert!(limiter.check(None, 2.0));
        assert!(limiter.check(None, 3.0));
        assert!(!limiter.check(None, 4.0));
    }
}
