//! Wire protocol: CBOR envelopes over UDP datagrams.
//!
//! Every datagram carries exactly one envelope:
//!
//! ```text
//! { "type": u8, "id": bytes[16], "node_id": bytes[20], "payload": {...}, "timestamp": u64 }
//! ```
//!
//! CBOR keeps the frame self-describing and byte strings intact. Message
//! kinds are one-byte discriminants; requests and their responses share the
//! same 16-byte random `id`, which is what correlates replies back to
//! outstanding requests.

use lib_crypto::NodeId;
use lib_popularity::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::DhtError;
use crate::peer::{unix_now, Peer};

/// Maximum UDP payload we will emit. Oversize messages are rejected before
/// send rather than fragmented at the application layer.
pub const MAX_DATAGRAM: usize = 65_507;

/// Length of a message ID.
pub const MESSAGE_ID_LEN: usize = 16;

/// One-byte message discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Ping,
    Pong,
    FindNode,
    FindNodeResp,
    FindValue,
    FindValueResp,
    Store,
    StoreResp,
    PopularityExchange,
    PopularityExchangeResp,
    GlobalRankingReq,
    GlobalRankingResp,
}

impl MessageKind {
    /// True for reply kinds, which are only meaningful against an
    /// outstanding request id.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::Pong
                | MessageKind::FindNodeResp
                | MessageKind::FindValueResp
                | MessageKind::StoreResp
                | MessageKind::PopularityExchangeResp
                | MessageKind::GlobalRankingResp
        )
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Ping => 0x01,
            MessageKind::Pong => 0x02,
            MessageKind::FindNode => 0x03,
            MessageKind::FindNodeResp => 0x04,
            MessageKind::FindValue => 0x05,
            MessageKind::FindValueResp => 0x06,
            MessageKind::Store => 0x07,
            MessageKind::StoreResp => 0x08,
            MessageKind::PopularityExchange => 0x09,
            MessageKind::PopularityExchangeResp => 0x0A,
            MessageKind::GlobalRankingReq => 0x0B,
            MessageKind::GlobalRankingResp => 0x0C,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        Ok(match code {
            0x01 => MessageKind::Ping,
            0x02 => MessageKind::Pong,
            0x03 => MessageKind::FindNode,
            0x04 => MessageKind::FindNodeResp,
            0x05 => MessageKind::FindValue,
            0x06 => MessageKind::FindValueResp,
            0x07 => MessageKind::Store,
            0x08 => MessageKind::StoreResp,
            0x09 => MessageKind::PopularityExchange,
            0x0A => MessageKind::PopularityExchangeResp,
            0x0B => MessageKind::GlobalRankingReq,
            0x0C => MessageKind::GlobalRankingResp,
            other => return Err(format!("unknown message type 0x{other:02X}")),
        })
    }
}

/// A peer as carried in FIND_NODE / FIND_VALUE responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
}

impl NodeEntry {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            node_id: peer.node_id,
            address: peer.address.clone(),
            port: peer.port,
        }
    }

    pub fn into_peer(self) -> Peer {
        Peer::new(self.node_id, self.address, self.port)
    }
}

/// One entry of a popularity exchange or global ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeItem {
    /// Hex-encoded key bytes.
    pub key: String,
    pub score: f64,
    pub metrics: MetricsSnapshot,
}

/// Message payload. Each kind populates its own subset of fields; absent
/// fields are omitted from the encoded map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ExchangeItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranking: Option<Vec<ExchangeItem>>,
}

/// The framed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    pub node_id: NodeId,
    pub payload: Payload,
    pub timestamp: u64,
}

impl Envelope {
    /// Build a request with a fresh random 16-byte id.
    pub fn request(kind: MessageKind, node_id: NodeId, payload: Payload) -> Result<Self, DhtError> {
        Ok(Self {
            kind,
            id: new_message_id()?.to_vec(),
            node_id,
            payload,
            timestamp: unix_now(),
        })
    }

    /// Build a message with a caller-provided id.
    pub fn with_id(
        kind: MessageKind,
        id: [u8; MESSAGE_ID_LEN],
        node_id: NodeId,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            id: id.to_vec(),
            node_id,
            payload,
            timestamp: unix_now(),
        }
    }

    /// Build a response reusing the request's id.
    pub fn response(kind: MessageKind, id: Vec<u8>, node_id: NodeId, payload: Payload) -> Self {
        Self {
            kind,
            id,
            node_id,
            payload,
            timestamp: unix_now(),
        }
    }

    /// The id as a fixed array, when well-formed.
    pub fn id_bytes(&self) -> Option<[u8; MESSAGE_ID_LEN]> {
        self.id.as_slice().try_into().ok()
    }

    /// Encode to CBOR, refusing frames that exceed one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| DhtError::Encode(e.to_string()))?;
        if buf.len() > MAX_DATAGRAM {
            return Err(DhtError::DatagramTooLarge {
                size: buf.len(),
                max: MAX_DATAGRAM,
            });
        }
        Ok(buf)
    }

    /// Decode one datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        let envelope: Envelope =
            ciborium::de::from_reader(bytes).map_err(|e| DhtError::Decode(e.to_string()))?;
        if envelope.id.len() != MESSAGE_ID_LEN {
            return Err(DhtError::Decode(format!(
                "bad message id length {}",
                envelope.id.len()
            )));
        }
        Ok(envelope)
    }
}

/// Fresh random message id.
pub fn new_message_id() -> Result<[u8; MESSAGE_ID_LEN], DhtError> {
    let mut id = [0u8; MESSAGE_ID_LEN];
    getrandom::getrandom(&mut id).map_err(|e| DhtError::Encode(format!("rng failure: {e}")))?;
    Ok(id)
}
