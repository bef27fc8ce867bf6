//! Ember Identity and Hashing Foundation
//!
//! Node identities are 160-bit (20-byte) IDs derived by hashing a locally
//! generated Ed25519 public key. The ID is persisted as raw bytes so a node
//! keeps the same identity across restarts.
//!
//! This crate also provides the digest helpers used to map arbitrary byte
//! strings onto the DHT keyspace (SHA-256, plus a 20-byte truncated form).

pub mod digest;
pub mod identity;

pub use digest::{hash_key, short_digest};
pub use identity::{
    generate_node_id, load_node_id, load_or_generate_node_id, save_node_id, NodeId, NODE_ID_LEN,
};
