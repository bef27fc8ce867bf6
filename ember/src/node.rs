//! The node supervisor.
//!
//! Owns every component of a running node and the three background loops:
//!
//! 1. Maintenance (60 s): refresh idle buckets, sweep expired store entries.
//! 2. Popularity tick (60 s): hourly score recompute with TTL extension and
//!    replication, six-hourly top-100 exchange, per-tick freshness refresh
//!    and metrics pruning.
//! 3. Seed loop (5 min, seed nodes only): three-hourly global-ranking
//!    consensus.
//!
//! Loops log and continue on failure; nothing here propagates errors after
//! startup. Multiple nodes in one process share no state, which the test
//! suite depends on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lib_crypto::{load_or_generate_node_id, NodeId};
use lib_dht::peer::{unix_now, unix_now_f64};
use lib_dht::{
    DhtEngine, DhtError, NetworkProtocol, Peer, PopularityExchanger, ProtocolConfig, Replicator,
    RoutingTable, UdpTransport,
};
use lib_popularity::{MetricsCollector, PopularityRanker, RankedItem};
use lib_storage::{Store, StoreLimits};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, NodeType};

/// Store snapshot file name inside the data directory.
const STORE_SNAPSHOT_FILE: &str = "store.snapshot";

/// A running (or stoppable) Ember node.
pub struct Node {
    config: Config,
    node_id: NodeId,
    node_type: NodeType,
    routing: Arc<RwLock<RoutingTable>>,
    store: Arc<Store>,
    metrics: Arc<Mutex<MetricsCollector>>,
    protocol: Arc<NetworkProtocol>,
    engine: Arc<DhtEngine>,
    exchanger: Arc<PopularityExchanger>,
    replicator: Arc<Replicator>,
    ranker: PopularityRanker,
    snapshot_path: PathBuf,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node from configuration: identity, storage, transport and
    /// the full protocol stack. Fatal errors here (bad config, unreadable
    /// identity file, socket bind failure) abort startup.
    pub async fn new(mut config: Config) -> Result<Self> {
        config.apply_node_type_limits();
        let node_type = config.node.node_type;

        if config.dht.node_id_bits != 160 || config.dht.bucket_count != 160 {
            warn!(
                node_id_bits = config.dht.node_id_bits,
                bucket_count = config.dht.bucket_count,
                "non-standard ID geometry configured; this build uses 160/160"
            );
        }

        let data_dir = PathBuf::from(&config.storage.data_dir);
        let node_id_path = {
            let p = PathBuf::from(&config.node.node_id_file);
            if p.is_absolute() {
                p
            } else {
                data_dir.join(p)
            }
        };
        let node_id =
            load_or_generate_node_id(&node_id_path).context("loading node identity")?;

        let store = Arc::new(Store::new(StoreLimits {
            max_bytes: config.storage.max_storage_size,
            popular_ttl: Duration::from_secs(config.storage.popular_ttl),
        }));
        let snapshot_path = data_dir.join(STORE_SNAPSHOT_FILE);
        if let Err(e) = store.load_from_file(&snapshot_path).await {
            warn!(error = %e, "could not load store snapshot, starting empty");
        }

        let routing = Arc::new(RwLock::new(RoutingTable::new(node_id, config.dht.k)));
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));

        let transport = UdpTransport::bind(&config.network.listen_host, config.network.listen_port)
            .await
            .context("binding UDP socket")?;
        let local_addr = transport.local_addr().context("resolving local address")?;

        let protocol = Arc::new(NetworkProtocol::new(
            node_id,
            (local_addr.ip().to_string(), local_addr.port()),
            transport,
            Arc::clone(&routing),
            Arc::clone(&store),
            Arc::clone(&metrics),
            ProtocolConfig {
                k: config.dht.k,
                request_timeout: Duration::from_secs_f64(config.dht.request_timeout),
                ping_timeout: Duration::from_secs_f64(config.dht.ping_timeout),
                rate_limit_requests: config.security.rate_limit_requests,
                rate_limit_window_secs: config.security.rate_limit_window,
                rate_limit_per_node: config.security.rate_limit_per_node,
            },
        ));

        let engine = Arc::new(DhtEngine::new(
            node_id,
            config.dht.alpha,
            config.dht.k,
            Arc::clone(&routing),
            Arc::clone(&store),
            Arc::clone(&metrics),
            Arc::clone(&protocol),
        ));

        let ranker = PopularityRanker::new(
            config.popularity.popularity_threshold,
            config.popularity.active_threshold,
        );
        let exchanger = Arc::new(PopularityExchanger::new(
            Arc::clone(&metrics),
            ranker.clone(),
            Arc::clone(&protocol),
        ));
        protocol.set_exchanger(&exchanger);

        let replicator = Arc::new(Replicator::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            5,
            10,
            Duration::from_secs(config.storage.default_ttl),
            Duration::from_secs(config.storage.popular_ttl),
        ));

        info!(
            node_id = %node_id.short_hex(),
            node_type = %node_type,
            addr = %local_addr,
            "node initialized"
        );

        Ok(Self {
            config,
            node_id,
            node_type,
            routing,
            store,
            metrics,
            protocol,
            engine,
            exchanger,
            replicator,
            ranker,
            snapshot_path,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, DhtError> {
        self.protocol.local_addr()
    }

    pub fn routing(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing
    }

    pub fn store_handle(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Mutex<MetricsCollector>> {
        &self.metrics
    }

    pub fn engine(&self) -> &Arc<DhtEngine> {
        &self.engine
    }

    pub fn exchanger(&self) -> &Arc<PopularityExchanger> {
        &self.exchanger
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn ranker(&self) -> &PopularityRanker {
        &self.ranker
    }

    /// Start the protocol, bootstrap into the overlay, and spawn the
    /// background loops.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node_id.short_hex(), "starting node");

        self.protocol.start().await;
        self.bootstrap().await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(maintenance_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(popularity_loop(Arc::clone(self))));
        if self.node_type == NodeType::Seed {
            tasks.push(tokio::spawn(seed_loop(Arc::clone(self))));
        }

        info!(node_id = %self.node_id.short_hex(), "node started");
    }

    /// Stop loops, drain outstanding requests, persist the store snapshot.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node_id.short_hex(), "stopping node");

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.protocol.stop().await;

        if let Err(e) = self.store.save_to_file(&self.snapshot_path).await {
            warn!(error = %e, "could not persist store snapshot");
        }

        info!(node_id = %self.node_id.short_hex(), "node stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Store a value in the DHT (locally plus the k closest peers).
    pub async fn store(&self, key: &[u8], value: &[u8], ttl: Duration) -> bool {
        self.engine.store(key, value, ttl).await
    }

    /// Retrieve a value from the DHT.
    pub async fn find_value(&self, key: &[u8]) -> Result<Vec<u8>, DhtError> {
        self.engine.find_value(key).await
    }

    /// Contact every configured bootstrap endpoint. The peer's real node
    /// ID is learned from its PONG; endpoints that do not answer are
    /// logged and skipped. Never fatal.
    async fn bootstrap(&self) {
        let endpoints = self.config.network.bootstrap_nodes.clone();
        if endpoints.is_empty() {
            warn!("no bootstrap nodes configured");
            return;
        }
        info!(count = endpoints.len(), "bootstrapping");

        let mut connected = false;
        for endpoint in &endpoints {
            let Some((host, port)) = parse_endpoint(endpoint) else {
                warn!(endpoint = %endpoint, "malformed bootstrap endpoint, skipping");
                continue;
            };

            match self.protocol.ping_endpoint(&host, port).await {
                Some(peer_id) if peer_id == self.node_id => {
                    debug!(endpoint = %endpoint, "bootstrap endpoint is this node, skipping");
                }
                Some(peer_id) => {
                    info!(endpoint = %endpoint, peer = %peer_id.short_hex(), "bootstrap peer connected");
                    self.routing
                        .write()
                        .await
                        .add(Peer::new(peer_id, host, port));
                    connected = true;
                }
                None => {
                    warn!(endpoint = %endpoint, "bootstrap peer unreachable");
                }
            }
        }

        if connected {
            // Populate the buckets by looking up our own neighborhood.
            let discovered = self.engine.find_node(&self.node_id).await;
            info!(discovered = discovered.len(), "bootstrap lookup complete");
        } else {
            warn!("bootstrap completed with no connections");
        }
    }

    /// One maintenance pass: refresh idle buckets, sweep the store.
    pub async fn run_maintenance(&self) {
        let now = unix_now();
        let refresh_interval = self.config.dht.refresh_interval;

        let stale_buckets = {
            let routing = self.routing.read().await;
            routing.buckets_needing_refresh(now, refresh_interval)
        };
        for index in stale_buckets {
            let target = {
                let routing = self.routing.read().await;
                routing.random_id_in_bucket(index)
            };
            debug!(bucket = index, "refreshing bucket");
            self.engine.find_node(&target).await;
            self.routing.write().await.mark_bucket_refreshed(index, now);
        }

        let removed = self.store.cleanup_expired().await;
        if removed > 0 {
            debug!(count = removed, "cleaned up expired entries");
        }
    }

    /// Hourly popularity pass: recompute scores, extend TTLs, replicate.
    pub async fn run_popularity_update(&self) {
        let now = unix_now_f64();
        let ranked: Vec<RankedItem> = {
            let metrics = self.metrics.lock().await;
            if metrics.is_empty() {
                return;
            }
            self.ranker.rank_items(metrics.all(), now, Some(100))
        };

        for item in &ranked {
            if item.score >= self.ranker.popularity_threshold {
                self.store.extend_ttl(&item.key, 1.0).await;
            } else if item.score >= self.ranker.active_threshold {
                self.store.extend_ttl(&item.key, 0.5).await;
            }
        }

        let popular: Vec<RankedItem> = ranked
            .into_iter()
            .filter(|item| item.score >= self.ranker.popularity_threshold)
            .collect();
        let popular_count = popular.len();
        if !popular.is_empty() {
            self.replicator
                .replicate_popular(&popular, self.ranker.popularity_threshold)
                .await;
        }

        info!(popular_count, "updated popularity rankings");
    }

    /// Six-hourly gossip with up to ten neighbors.
    pub async fn run_exchange(&self) {
        let neighbors: Vec<Peer> = {
            let routing = self.routing.read().await;
            routing.all().into_iter().take(10).collect()
        };
        if neighbors.is_empty() {
            return;
        }
        self.exchanger.exchange_top_items(&neighbors, 100).await;
    }

    /// Seed-only: rebuild the global consensus ranking.
    pub async fn run_global_ranking_update(&self) {
        let seeds: Vec<Peer> = {
            let routing = self.routing.read().await;
            routing.all().into_iter().take(10).collect()
        };
        self.exchanger
            .aggregate_global_ranking(&seeds, unix_now_f64())
            .await;
    }
}

fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Bucket refresh + store sweep, every minute.
async fn maintenance_loop(node: Arc<Node>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        if !node.is_running() {
            break;
        }
        node.run_maintenance().await;
    }
}

/// Popularity bookkeeping, every minute; heavy work on its own intervals.
async fn popularity_loop(node: Arc<Node>) {
    let update_interval = Duration::from_secs(node.config.popularity.update_interval);
    let exchange_interval = Duration::from_secs(node.config.popularity.exchange_interval);
    let mut last_update: Option<Instant> = None;
    let mut last_exchange: Option<Instant> = None;

    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        if !node.is_running() {
            break;
        }

        if last_update.map_or(true, |t| t.elapsed() >= update_interval) {
            node.run_popularity_update().await;
            last_update = Some(Instant::now());
        }
        if last_exchange.map_or(true, |t| t.elapsed() >= exchange_interval) {
            node.run_exchange().await;
            last_exchange = Some(Instant::now());
        }

        let now = unix_now_f64();
        let mut metrics = node.metrics.lock().await;
        metrics.update_all_freshness(now);
        metrics.cleanup_old(now, lib_popularity::metrics::METRICS_MAX_AGE_DAYS);
    }
}

/// Seed-node consensus loop, checked every five minutes.
async fn seed_loop(node: Arc<Node>) {
    let global_interval = Duration::from_secs(node.config.popularity.global_update_interval);
    let mut last_update: Option<Instant> = None;

    let mut ticker = tokio::time::interval(Duration::from_secs(300));
    loop {
        ticker.tick().await;
        if !node.is_running() {
            break;
        }
        if last_update.map_or(true, |t| t.elapsed() >= global_interval) {
            node.run_global_ranking_update().await;
            last_update = Some(Instant::now());
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            error!("node dropped while running; call stop() for a clean shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("10.0.0.1:8468"),
            Some(("10.0.0.1".to_string(), 8468))
        );
        assert_eq!(parse_endpoint("host.example:99"), Some(("host.example".to_string(), 99)));
        assert_eq!(parse_endpoint("nonsense"), None);
        assert_eq!(parse_endpoint(":8468"), None);
        assert_eq!(parse_endpoint("10.0.0.1:notaport"), None);
    }
}
