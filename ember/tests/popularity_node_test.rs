//! Popularity engine integration tests: promotion, gossip, consensus.

use std::sync::Arc;
use std::time::Duration;

use ember::config::{Config, NodeType};
use ember::node::Node;
use lib_crypto::{hash_key, NodeId};
use lib_dht::peer::unix_now_f64;
use lib_popularity::KeyMetrics;
use tempfile::TempDir;

fn test_config(data_dir: &TempDir, bootstrap: Vec<String>) -> Config {
    let mut config = Config::default();
    config.network.listen_host = "127.0.0.1".into();
    config.network.listen_port = 0;
    config.network.bootstrap_nodes = bootstrap;
    config.storage.data_dir = data_dir.path().to_string_lossy().into_owned();
    config.dht.request_timeout = 1.0;
    config.dht.ping_timeout = 1.0;
    config
}

async fn start_node(data_dir: &TempDir, bootstrap: Vec<String>) -> Arc<Node> {
    let node = Arc::new(Node::new(test_config(data_dir, bootstrap)).await.unwrap());
    node.start().await;
    node
}

fn endpoint_of(node: &Node) -> String {
    let addr = node.local_addr().unwrap();
    format!("{}:{}", addr.ip(), addr.port())
}

/// A key requested 60 times in the last minute by distinct peers, value
/// two hours old, modestly replicated and socially active.
fn hot_metrics(now: f64) -> KeyMetrics {
    let mut metrics = KeyMetrics::new(now - 7200.0);
    for i in 0..60u8 {
        let requester = NodeId::from_bytes([i + 1; 20]);
        metrics.record_request(Some(&requester), now - 60.0 + i as f64);
    }
    metrics.update_replication(5);
    metrics.add_social_engagements(50);
    metrics.update_freshness(now);
    metrics
}

#[tokio::test]
async fn popular_key_is_promoted_and_replicated() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&dir, vec![]).await;

    let key = hash_key(b"hot-content").to_vec();
    node.store_handle()
        .put(&key, b"hot-value", Duration::from_secs(3600))
        .await
        .unwrap();

    let now = unix_now_f64();
    node.metrics().lock().await.insert(key.clone(), hot_metrics(now));

    let ranked = {
        let metrics = node.metrics().lock().await;
        node.ranker().rank_items(metrics.all(), now, None)
    };
    assert_eq!(ranked[0].key, key);
    assert!(
        ranked[0].score >= 7.0,
        "expected promotion, score = {}",
        ranked[0].score
    );

    let results = node.replicator().replicate_popular(&ranked, 7.0).await;
    assert_eq!(results.get(&key), Some(&true));

    // The re-store credited a full replica set.
    let metrics = node.metrics().lock().await;
    assert_eq!(metrics.get(&key).unwrap().replication_count, 20);
    drop(metrics);

    assert_eq!(
        node.store_handle().get(&key).await,
        Some(b"hot-value".to_vec())
    );
    node.stop().await;
}

#[tokio::test]
async fn gossip_spreads_metrics_to_neighbors() {
    let dir_b = TempDir::new().unwrap();
    let node_b = start_node(&dir_b, vec![]).await;

    let dir_a = TempDir::new().unwrap();
    let node_a = start_node(&dir_a, vec![endpoint_of(&node_b)]).await;

    let key = hash_key(b"gossip-worthy").to_vec();
    let now = unix_now_f64();
    node_a.metrics().lock().await.insert(key.clone(), hot_metrics(now));

    node_a.run_exchange().await;

    let b_metrics = node_b.metrics().lock().await;
    let received = b_metrics.get(&key).expect("metrics did not propagate");
    assert_eq!(received.replication_count, 5);

    drop(b_metrics);
    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn seed_builds_and_serves_global_ranking() {
    let dir_peer = TempDir::new().unwrap();
    let peer_node = start_node(&dir_peer, vec![]).await;

    let dir_seed = TempDir::new().unwrap();
    let mut config = test_config(&dir_seed, vec![endpoint_of(&peer_node)]);
    config.node.node_type = NodeType::Seed;
    let seed = Arc::new(Node::new(config).await.unwrap());
    seed.start().await;
    assert_eq!(seed.node_type(), NodeType::Seed);

    let key = hash_key(b"consensus-content").to_vec();
    let now = unix_now_f64();
    seed.metrics().lock().await.insert(key.clone(), hot_metrics(now));

    seed.run_global_ranking_update().await;

    let ranking = seed.exchanger().cached_global_ranking().await;
    assert!(!ranking.is_empty());
    assert_eq!(ranking[0].key, hex::encode(&key));

    node_queries_seed(&peer_node, &seed, &ranking[0].key).await;

    seed.stop().await;
    peer_node.stop().await;
}

/// The cached consensus is served over the wire to whoever asks.
async fn node_queries_seed(asker: &Node, seed: &Node, expected_key_hex: &str) {
    let addr = seed.local_addr().unwrap();
    let seed_peer = lib_dht::Peer::new(*seed.node_id(), addr.ip().to_string(), addr.port());

    let ranking = asker
        .exchanger()
        .aggregate_global_ranking(&[seed_peer], unix_now_f64())
        .await;
    assert!(
        ranking.iter().any(|item| item.key == expected_key_hex),
        "seed ranking did not reach the asking node"
    );
}
