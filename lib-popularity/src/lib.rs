//! Ember Popularity Engine
//!
//! Pure domain logic for the popularity subsystem: per-key request metrics
//! and the age-adaptive scoring that decides which values get their TTLs
//! extended and extra replicas.
//!
//! Nothing here does I/O. Timestamps come in as unix seconds so callers
//! (and tests) control the clock; the networked pieces that move this data
//! between peers live in the DHT crate.

pub mod metrics;
pub mod ranking;

pub use metrics::{KeyMetrics, MetricsCollector, MetricsSnapshot};
pub use ranking::{PopularityRanker, RankedItem, Weights};
