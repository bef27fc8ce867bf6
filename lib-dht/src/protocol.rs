//! Request/response protocol over the UDP transport.
//!
//! A single receive loop decodes inbound envelopes and splits them two
//! ways: response kinds fulfill the completion slot registered under their
//! id, request kinds are dispatched to the handler match. Each outstanding
//! request is a oneshot slot raced against a timer; on timeout the slot is
//! discarded and the peer's failure counter bumped.
//!
//! Every inbound datagram passes the rate limiter first and registers its
//! sender in the routing table, so traffic alone keeps `last_seen` fresh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lib_crypto::NodeId;
use lib_popularity::MetricsCollector;
use lib_storage::Store;
use once_cell::sync::OnceCell;
use serde_bytes::ByteBuf;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::distance::target_for_key;
use crate::error::DhtError;
use crate::exchange::PopularityExchanger;
use crate::peer::{unix_now_f64, Peer};
use crate::rate_limit::RateLimiter;
use crate::routing::RoutingTable;
use crate::transport::UdpTransport;
use crate::wire::{Envelope, ExchangeItem, MessageKind, NodeEntry, Payload, MESSAGE_ID_LEN};

/// Tunables for one protocol instance.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Replication / closest-peer count used by the handlers.
    pub k: usize,
    pub request_timeout: Duration,
    pub ping_timeout: Duration,
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_per_node: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            k: 20,
            request_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            rate_limit_requests: 100,
            rate_limit_window_secs: 60,
            rate_limit_per_node: 20,
        }
    }
}

/// A correlated reply delivered to an awaiting request.
#[derive(Debug)]
pub struct Reply {
    pub kind: MessageKind,
    pub sender: NodeId,
    pub payload: Payload,
}

/// Result of a FIND_VALUE RPC against one peer.
#[derive(Debug, Default)]
pub struct FindValueReply {
    pub value: Option<Vec<u8>>,
    pub nodes: Vec<Peer>,
}

type PendingMap = HashMap<[u8; MESSAGE_ID_LEN], oneshot::Sender<Reply>>;

/// The wire-facing half of the node.
pub struct NetworkProtocol {
    node_id: NodeId,
    /// Address advertised in PONG replies.
    advertised: (String, u16),
    transport: UdpTransport,
    routing: Arc<RwLock<RoutingTable>>,
    store: Arc<Store>,
    metrics: Arc<Mutex<MetricsCollector>>,
    /// Set once after construction; weak to avoid an Arc cycle with the
    /// exchanger, which holds the protocol.
    exchanger: OnceCell<Weak<PopularityExchanger>>,
    pending: Mutex<PendingMap>,
    rate_limiter: Mutex<RateLimiter>,
    config: ProtocolConfig,
    running: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkProtocol {
    pub fn new(
        node_id: NodeId,
        advertised: (String, u16),
        transport: UdpTransport,
        routing: Arc<RwLock<RoutingTable>>,
        store: Arc<Store>,
        metrics: Arc<Mutex<MetricsCollector>>,
        config: ProtocolConfig,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window_secs,
            config.rate_limit_per_node,
        );
        Self {
            node_id,
            advertised,
            transport,
            routing,
            store,
            metrics,
            exchanger: OnceCell::new(),
            pending: Mutex::new(HashMap::new()),
            rate_limiter: Mutex::new(rate_limiter),
            config,
            running: AtomicBool::new(false),
            recv_task: Mutex::new(None),
        }
    }

    /// Post-construction hook wiring in the popularity exchanger.
    pub fn set_exchanger(&self, exchanger: &Arc<PopularityExchanger>) {
        if self.exchanger.set(Arc::downgrade(exchanger)).is_err() {
            warn!("popularity exchanger already attached");
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        self.transport.local_addr()
    }

    /// Start the receive loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let protocol = Arc::clone(self);
        let socket = self.transport.socket();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if !protocol.running.load(Ordering::SeqCst) {
                            break;
                        }
                        let data = buf[..len].to_vec();
                        let dispatcher = Arc::clone(&protocol);
                        tokio::spawn(async move {
                            dispatcher.handle_datagram(data, from).await;
                        });
                    }
                    Err(e) => {
                        if !protocol.running.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "UDP receive failed");
                    }
                }
            }
        });
        *self.recv_task.lock().await = Some(handle);
        debug!(node_id = %self.node_id.short_hex(), "network protocol started");
    }

    /// Stop the receive loop and fail all outstanding requests.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }
        // Dropping the senders wakes every awaiter with a shutdown error.
        self.pending.lock().await.clear();
        debug!(node_id = %self.node_id.short_hex(), "network protocol stopped");
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    async fn handle_datagram(&self, data: Vec<u8>, from: SocketAddr) {
        let envelope = match Envelope::decode(&data) {
            Ok(env) => env,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        let sender = envelope.node_id;

        {
            let mut limiter = self.rate_limiter.lock().await;
            if !limiter.check(Some(&sender), unix_now_f64()) {
                warn!(sender = %sender.short_hex(), %from, "rate limit exceeded, dropping message");
                return;
            }
        }

        // Any traffic from a peer refreshes its routing-table entry.
        if !sender.is_zero() {
            let peer = Peer::new(sender, from.ip().to_string(), from.port());
            self.routing.write().await.add(peer);
        }

        if envelope.kind.is_response() {
            let Some(id) = envelope.id_bytes() else {
                return;
            };
            match self.pending.lock().await.remove(&id) {
                Some(slot) => {
                    let _ = slot.send(Reply {
                        kind: envelope.kind,
                        sender,
                        payload: envelope.payload,
                    });
                }
                None => {
                    trace!(%from, "response with no outstanding request, dropping");
                }
            }
            return;
        }

        self.handle_request(envelope, from).await;
    }

    /// Dispatch one inbound request and send the reply, if any.
    async fn handle_request(&self, envelope: Envelope, from: SocketAddr) {
        let sender = envelope.node_id;
        let reply = match envelope.kind {
            MessageKind::Ping => Some((
                MessageKind::Pong,
                Payload {
                    address: Some(self.advertised.0.clone()),
                    port: Some(self.advertised.1),
                    ..Default::default()
                },
            )),

            MessageKind::FindNode => {
                let Some(target_bytes) = envelope.payload.target_id.as_ref() else {
                    debug!(%from, "FIND_NODE without target, dropping");
                    return;
                };
                let Ok(target) = NodeId::from_slice(target_bytes) else {
                    debug!(%from, "FIND_NODE with malformed target, dropping");
                    return;
                };
                let closest = self.routing.read().await.find_closest(&target, self.config.k);
                Some((
                    MessageKind::FindNodeResp,
                    Payload {
                        nodes: Some(closest.iter().map(NodeEntry::from_peer).collect()),
                        ..Default::default()
                    },
                ))
            }

            MessageKind::FindValue => {
                let Some(key) = envelope.payload.key.as_ref() else {
                    debug!(%from, "FIND_VALUE without key, dropping");
                    return;
                };
                match self.store.get(key).await {
                    Some(value) => {
                        self.metrics.lock().await.record_find_value(
                            key,
                            Some(&sender),
                            unix_now_f64(),
                        );
                        Some((
                            MessageKind::FindValueResp,
                            Payload {
                                found: Some(true),
                                value: Some(ByteBuf::from(value)),
                                ..Default::default()
                            },
                        ))
                    }
                    None => {
                        let target = target_for_key(key);
                        let closest =
                            self.routing.read().await.find_closest(&target, self.config.k);
                        Some((
                            MessageKind::FindValueResp,
                            Payload {
                                found: Some(false),
                                nodes: Some(closest.iter().map(NodeEntry::from_peer).collect()),
                                ..Default::default()
                            },
                        ))
                    }
                }
            }

            MessageKind::Store => {
                let (Some(key), Some(value)) =
                    (envelope.payload.key.as_ref(), envelope.payload.value.as_ref())
                else {
                    debug!(%from, "STORE without key/value, dropping");
                    return;
                };
                let ttl = Duration::from_secs(envelope.payload.ttl.unwrap_or(86_400));
                match self.store.put(key, value, ttl).await {
                    Ok(()) => {
                        debug!(
                            key = %hex::encode(&key[..key.len().min(8)]),
                            size = value.len(),
                            "stored value"
                        );
                        Some((
                            MessageKind::StoreResp,
                            Payload {
                                success: Some(true),
                                ..Default::default()
                            },
                        ))
                    }
                    Err(e) => {
                        warn!(error = %e, "remote STORE rejected");
                        Some((
                            MessageKind::StoreResp,
                            Payload {
                                success: Some(false),
                                error: Some(e.to_string()),
                                ..Default::default()
                            },
                        ))
                    }
                }
            }

            MessageKind::PopularityExchange => {
                let items = envelope.payload.items.unwrap_or_default();
                match self.exchanger() {
                    Some(exchanger) => {
                        let local =
                            exchanger.local_top_items(100, unix_now_f64()).await;
                        exchanger.process_received_items(&items).await;
                        Some((
                            MessageKind::PopularityExchangeResp,
                            Payload {
                                items: Some(local),
                                ..Default::default()
                            },
                        ))
                    }
                    None => Some((
                        MessageKind::PopularityExchangeResp,
                        Payload {
                            items: Some(Vec::new()),
                            ..Default::default()
                        },
                    )),
                }
            }

            MessageKind::GlobalRankingReq => {
                let ranking = match self.exchanger() {
                    Some(exchanger) => exchanger.cached_global_ranking().await,
                    None => Vec::new(),
                };
                Some((
                    MessageKind::GlobalRankingResp,
                    Payload {
                        ranking: Some(ranking),
                        ..Default::default()
                    },
                ))
            }

            // Response kinds are handled in handle_datagram.
            MessageKind::Pong
            | MessageKind::FindNodeResp
            | MessageKind::FindValueResp
            | MessageKind::StoreResp
            | MessageKind::PopularityExchangeResp
            | MessageKind::GlobalRankingResp => None,
        };

        if let Some((kind, payload)) = reply {
            let response = Envelope::response(kind, envelope.id, self.node_id, payload);
            match response.encode() {
                Ok(bytes) => {
                    let host = from.ip().to_string();
                    if let Err(e) = self.transport.send_to(&bytes, (&host, from.port())).await {
                        debug!(%from, error = %e, "failed to send reply");
                    }
                }
                Err(e) => warn!(%from, error = %e, "failed to encode reply"),
            }
        }
    }

    fn exchanger(&self) -> Option<Arc<PopularityExchanger>> {
        self.exchanger.get().and_then(Weak::upgrade)
    }

    // ------------------------------------------------------------------
    // Outbound RPCs
    // ------------------------------------------------------------------

    /// Register a completion slot, send the request, and race the slot
    /// against the timeout.
    async fn request(
        &self,
        kind: MessageKind,
        payload: Payload,
        endpoint: (&str, u16),
        timeout: Duration,
    ) -> Result<Reply, DhtError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(DhtError::ShuttingDown);
        }

        let id = crate::wire::new_message_id()?;
        let envelope = Envelope::with_id(kind, id, self.node_id, payload);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
        };
        if let Err(e) = self.transport.send_to(&bytes, endpoint).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DhtError::ShuttingDown),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(DhtError::Timeout)
            }
        }
    }

    async fn mark_failed(&self, node_id: &NodeId) {
        self.routing.write().await.mark_failed(node_id);
    }

    /// PING a known peer. Failures bump the peer's failure counter.
    pub async fn ping(&self, peer: &Peer) -> bool {
        match self
            .request(
                MessageKind::Ping,
                Payload::default(),
                peer.endpoint(),
                self.config.ping_timeout,
            )
            .await
        {
            Ok(reply) if reply.kind == MessageKind::Pong => {
                self.routing.write().await.add(peer.clone());
                true
            }
            Ok(_) => false,
            Err(_) => {
                self.mark_failed(&peer.node_id).await;
                false
            }
        }
    }

    /// PING an endpoint whose node ID is unknown (bootstrap). On success
    /// the responder's real ID, learned from the PONG envelope, is
    /// returned; no placeholder entry ever touches the routing table.
    pub async fn ping_endpoint(&self, address: &str, port: u16) -> Option<NodeId> {
        match self
            .request(
                MessageKind::Ping,
                Payload::default(),
                (address, port),
                self.config.ping_timeout,
            )
            .await
        {
            Ok(reply) if reply.kind == MessageKind::Pong => Some(reply.sender),
            _ => None,
        }
    }

    /// FIND_NODE against one peer. Timeouts yield an empty list.
    pub async fn find_node(&self, target: &NodeId, peer: &Peer) -> Vec<Peer> {
        let payload = Payload {
            target_id: Some(ByteBuf::from(target.as_bytes().to_vec())),
            ..Default::default()
        };
        match self
            .request(
                MessageKind::FindNode,
                payload,
                peer.endpoint(),
                self.config.request_timeout,
            )
            .await
        {
            Ok(reply) if reply.kind == MessageKind::FindNodeResp => reply
                .payload
                .nodes
                .unwrap_or_default()
                .into_iter()
                .map(NodeEntry::into_peer)
                .collect(),
            Ok(_) => Vec::new(),
            Err(_) => {
                self.mark_failed(&peer.node_id).await;
                Vec::new()
            }
        }
    }

    /// FIND_VALUE against one peer.
    pub async fn find_value(&self, key: &[u8], peer: &Peer) -> FindValueReply {
        let payload = Payload {
            key: Some(ByteBuf::from(key.to_vec())),
            ..Default::default()
        };
        match self
            .request(
                MessageKind::FindValue,
                payload,
                peer.endpoint(),
                self.config.request_timeout,
            )
            .await
        {
            Ok(reply) if reply.kind == MessageKind::FindValueResp => FindValueReply {
                value: reply.payload.value.map(ByteBuf::into_vec),
                nodes: reply
                    .payload
                    .nodes
                    .unwrap_or_default()
                    .into_iter()
                    .map(NodeEntry::into_peer)
                    .collect(),
            },
            Ok(_) => FindValueReply::default(),
            Err(_) => {
                self.mark_failed(&peer.node_id).await;
                FindValueReply::default()
            }
        }
    }

    /// STORE one value on a peer. Any failure (timeout, oversize value,
    /// remote rejection) comes back as `false`.
    pub async fn store(&self, key: &[u8], value: &[u8], ttl_secs: u64, peer: &Peer) -> bool {
        let payload = Payload {
            key: Some(ByteBuf::from(key.to_vec())),
            value: Some(ByteBuf::from(value.to_vec())),
            ttl: Some(ttl_secs),
            ..Default::default()
        };
        match self
            .request(
                MessageKind::Store,
                payload,
                peer.endpoint(),
                self.config.request_timeout,
            )
            .await
        {
            Ok(reply) if reply.kind == MessageKind::StoreResp => {
                let success = reply.payload.success.unwrap_or(false);
                if !success {
                    debug!(
                        peer = %peer.node_id.short_hex(),
                        error = reply.payload.error.as_deref().unwrap_or("unknown"),
                        "remote STORE failed"
                    );
                }
                success
            }
            Ok(_) => false,
            Err(DhtError::Timeout) => {
                self.mark_failed(&peer.node_id).await;
                false
            }
            Err(e) => {
                debug!(peer = %peer.node_id.short_hex(), error = %e, "STORE send failed");
                false
            }
        }
    }

    /// Swap top-N popularity items with a peer, returning its list.
    pub async fn exchange_popularity(
        &self,
        items: Vec<ExchangeItem>,
        peer: &Peer,
    ) -> Result<Vec<ExchangeItem>, DhtError> {
        let payload = Payload {
            items: Some(items),
            ..Default::default()
        };
        let reply = self
            .request(
                MessageKind::PopularityExchange,
                payload,
                peer.endpoint(),
                self.config.request_timeout,
            )
            .await;
        match reply {
            Ok(reply) if reply.kind == MessageKind::PopularityExchangeResp => {
                Ok(reply.payload.items.unwrap_or_default())
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) => {
                self.mark_failed(&peer.node_id).await;
                Err(e)
            }
        }
    }

    /// Ask a seed node for its cached global ranking.
    pub async fn request_global_ranking(
        &self,
        peer: &Peer,
    ) -> Result<Vec<ExchangeItem>, DhtError> {
        let reply = self
            .request(
                MessageKind::GlobalRankingReq,
                Payload::default(),
                peer.endpoint(),
                self.config.request_timeout,
            )
            .await;
        match reply {
            Ok(reply) if reply.kind == MessageKind::GlobalRankingResp => {
                Ok(reply.payload.ranking.unwrap_or_default())
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) => {
                self.mark_failed(&peer.node_id).await;
                Err(e)
            }
        }
    }

    /// Number of requests still awaiting replies.
    pub async fn outstanding_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_storage::{StoreLimits, Store};

    async fn test_protocol(id_byte: u8) -> Arc<NetworkProtocol> {
        let node_id = NodeId::from_bytes([id_byte; 20]);
        let transport = UdpTransport::bind("127.0.0.1", 0).await.unwrap();
        let addr = transport.local_addr().unwrap();
        let routing = Arc::new(RwLock::new(RoutingTable::new(node_id, 20)));
        let store = Arc::new(Store::new(StoreLimits::default()));
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let config = ProtocolConfig {
            request_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let protocol = Arc::new(NetworkProtocol::new(
            node_id,
            (addr.ip().to_string(), addr.port()),
            transport,
            routing,
            store,
            metrics,
            config,
        ));
        protocol.start().await;
        protocol
    }

    fn peer_for(protocol: &NetworkProtocol) -> Peer {
        let addr = protocol.local_addr().unwrap();
        Peer::new(*protocol.node_id(), addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn ping_pong_registers_both_sides() {
        let a = test_protocol(1).await;
        let b = test_protocol(2).await;

        assert!(a.ping(&peer_for(&b)).await);

        // B learned about A from the inbound PING.
        let b_routing = b.routing.read().await;
        assert!(b_routing.all().iter().any(|p| p.node_id == *a.node_id()));
        drop(b_routing);

        assert_eq!(a.outstanding_requests().await, 0);
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn ping_endpoint_learns_real_id() {
        let a = test_protocol(3).await;
        let b = test_protocol(4).await;
        let b_addr = b.local_addr().unwrap();

        let learned = a
            .ping_endpoint(&b_addr.ip().to_string(), b_addr.port())
            .await;
        assert_eq!(learned, Some(*b.node_id()));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn store_and_find_value_rpc() {
        let a = test_protocol(5).await;
        let b = test_protocol(6).await;
        let target = peer_for(&b);

        assert!(a.store(b"key-x", b"value-x", 3600, &target).await);

        let reply = a.find_value(b"key-x", &target).await;
        assert_eq!(reply.value, Some(b"value-x".to_vec()));

        let miss = a.find_value(b"key-y", &target).await;
        assert_eq!(miss.value, None);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn timeout_against_dead_endpoint() {
        let a = test_protocol(7).await;
        // Nothing is listening here.
        let dead = Peer::new(NodeId::from_bytes([9; 20]), "127.0.0.1", 1);

        assert!(!a.ping(&dead).await);
        assert_eq!(a.outstanding_requests().await, 0);
        a.stop().await;
    }

    #[tokio::test]
    async fn unknown_response_id_is_dropped() {
        let a = test_protocol(8).await;
        let a_addr = a.local_addr().unwrap();

        // Hand-craft a PONG that matches no outstanding request.
        let stray = Envelope::response(
            MessageKind::Pong,
            vec![0xEE; MESSAGE_ID_LEN],
            NodeId::from_bytes([9; 20]),
            Payload::default(),
        );
        let sender = UdpTransport::bind("127.0.0.1", 0).await.unwrap();
        sender
            .send_to(
                &stray.encode().unwrap(),
                (&a_addr.ip().to_string(), a_addr.port()),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.outstanding_requests().await, 0);
        a.stop().await;
    }

    #[tokio::test]
    async fn find_node_returns_known_peers() {
        let a = test_protocol(10).await;
        let b = test_protocol(11).await;

        // Teach B about a third peer.
        let third = Peer::new(NodeId::from_bytes([12; 20]), "127.0.0.1", 40000);
        b.routing.write().await.add(third.clone());

        let found = a
            .find_node(&NodeId::from_bytes([12; 20]), &peer_for(&b))
            .await;
        assert!(found.iter().any(|p| p.node_id == third.node_id));

        a.stop().await;
        b.stop().await;
    }
}
