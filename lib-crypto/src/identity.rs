//! Node identity
//!
//! A `NodeId` is exactly 20 bytes (160 bits). New identities are derived by
//! generating an Ed25519 keypair and hashing the public key with SHA-256,
//! truncated to 20 bytes. Only the derived ID is persisted; the keypair is
//! discarded after derivation.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Length of a node ID in bytes (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// 160-bit node identifier.
///
/// Equality, hashing and ordering are over the raw bytes. Serialized as a
/// byte string so wire encodings keep it compact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Construct from a slice, validating length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_ID_LEN {
            return Err(anyhow!(
                "invalid node ID length: {} (expected {})",
                bytes.len(),
                NODE_ID_LEN
            ));
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Raw ID bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// All-zero ID. Used as a placeholder for peers whose real identity has
    /// not been learned yet; never inserted into routing state.
    pub fn zero() -> Self {
        Self([0u8; NODE_ID_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Abbreviated hex form for log output.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {NODE_ID_LEN}-byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<NodeId, E> {
        NodeId::from_slice(v).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<NodeId, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut bytes = Vec::with_capacity(NODE_ID_LEN);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        NodeId::from_slice(&bytes).map_err(|e| de::Error::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

/// Generate a fresh 160-bit node ID.
///
/// An Ed25519 keypair is generated and the public key hashed with SHA-256;
/// the first 20 bytes of the digest become the node ID.
pub fn generate_node_id() -> NodeId {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = signing_key.verifying_key();

    let digest = Sha256::digest(public_key.as_bytes());
    let mut id = [0u8; NODE_ID_LEN];
    id.copy_from_slice(&digest[..NODE_ID_LEN]);
    NodeId(id)
}

/// Persist a node ID as 20 raw bytes.
pub fn save_node_id(node_id: &NodeId, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(path, node_id.as_bytes())?;
    Ok(())
}

/// Load a node ID from disk. Returns `None` when the file does not exist.
pub fn load_node_id(path: &Path) -> Result<Option<NodeId>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(NodeId::from_slice(&bytes)?))
}

/// Load the node ID from `path`, generating and persisting a fresh one when
/// the file is missing.
pub fn load_or_generate_node_id(path: &Path) -> Result<NodeId> {
    if let Some(id) = load_node_id(path)? {
        return Ok(id);
    }
    let id = generate_node_id();
    save_node_id(&id, path)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_sized() {
        let a = generate_node_id();
        let b = generate_node_id();

        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), NODE_ID_LEN);
        assert!(!a.is_zero());
    }

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_id.bin");

        let generated = load_or_generate_node_id(&path).unwrap();
        let loaded = load_or_generate_node_id(&path).unwrap();

        assert_eq!(generated, loaded);
    }

    #[test]
    fn rejects_truncated_id_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_id.bin");
        std::fs::write(&path, [1u8; 7]).unwrap();

        assert!(load_node_id(&path).is_err());
    }

    #[test]
    fn display_is_full_hex() {
        let id = NodeId::from_bytes([0xab; NODE_ID_LEN]);
        assert_eq!(id.to_string(), "ab".repeat(NODE_ID_LEN));
    }
}
