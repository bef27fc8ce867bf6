//! Multi-node DHT integration tests over real UDP sockets on loopback.

use std::sync::Arc;
use std::time::Duration;

use ember::config::Config;
use ember::node::Node;
use lib_crypto::{hash_key, NodeId};
use lib_dht::Peer;
use tempfile::TempDir;

fn test_config(data_dir: &TempDir, bootstrap: Vec<String>) -> Config {
    let mut config = Config::default();
    config.network.listen_host = "127.0.0.1".into();
    config.network.listen_port = 0;
    config.network.bootstrap_nodes = bootstrap;
    config.storage.data_dir = data_dir.path().to_string_lossy().into_owned();
    // Keep failure paths fast in tests.
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

#[tokio::test]
async fn two_node_store_and_find() {
    let dir_b = TempDir::new().unwrap();
    let node_b = start_node(&dir_b, vec![]).await;

    let dir_a = TempDir::new().unwrap();
    let node_a = start_node(&dir_a, vec![endpoint_of(&node_b)]).await;

    let key = hash_key(b"k1");
    assert!(
        node_a
            .store(&key, b"v1", Duration::from_secs(3600))
            .await
    );

    let found = tokio::time::timeout(Duration::from_secs(5), node_b.find_value(&key))
        .await
        .expect("find_value exceeded 5s")
        .expect("value not found");
    assert_eq!(found, b"v1");

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn iterative_discovery_across_chain() {
    let dirs: Vec<TempDir> = (0..5).map(|_| TempDir::new().unwrap()).collect();

    let mut nodes: Vec<Arc<Node>> = Vec::new();
    nodes.push(start_node(&dirs[0], vec![]).await);
    for i in 1..5 {
        let previous = endpoint_of(&nodes[i - 1]);
        nodes.push(start_node(&dirs[i], vec![previous]).await);
    }

    let target = *nodes[4].node_id();
    let found = nodes[0].engine().find_node(&target).await;
    assert!(
        found.iter().any(|p| p.node_id == target),
        "node 0 did not discover node 4 (found {} peers)",
        found.len()
    );

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn store_succeeds_despite_dead_replica() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&dir, vec![]).await;

    // A peer whose port drops everything silently: nothing listens there.
    let dead_port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let dead = Peer::new(NodeId::from_bytes([0x42; 20]), "127.0.0.1", dead_port);
    node.routing().write().await.add(dead);

    let key = hash_key(b"lonely");
    // The remote STORE times out, the local put carries the operation.
    assert!(
        node.store(&key, b"survives", Duration::from_secs(3600))
            .await
    );
    assert_eq!(
        node.store_handle().get(&key).await,
        Some(b"survives".to_vec())
    );

    node.stop().await;
}

#[tokio::test]
async fn store_snapshot_survives_restart() {
    let dir = TempDir::new().unwrap();
    let key = hash_key(b"durable");

    {
        let node = start_node(&dir, vec![]).await;
        assert!(
            node.store(&key, b"payload", Duration::from_secs(3600))
                .await
        );
        node.stop().await;
    }

    let reborn = start_node(&dir, vec![]).await;
    assert_eq!(
        reborn.store_handle().get(&key).await,
        Some(b"payload".to_vec())
    );
    // Identity persisted alongside the data.
    assert!(!reborn.node_id().is_zero());
    reborn.stop().await;
}

#[tokio::test]
async fn nodes_in_one_process_are_isolated() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let node_a = start_node(&dir_a, vec![]).await;
    let node_b = start_node(&dir_b, vec![]).await;

    assert_ne!(node_a.node_id(), node_b.node_id());

    // Unconnected nodes share no storage.
    let key = hash_key(b"private");
    node_a.store(&key, b"mine", Duration::from_secs(60)).await;
    assert_eq!(node_b.store_handle().get(&key).await, None);

    node_a.stop().await;
    node_b.stop().await;
}
