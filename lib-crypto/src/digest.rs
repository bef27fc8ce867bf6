//! Digest helpers for the DHT keyspace.

use sha2::{Digest, Sha256};

/// SHA-256 digest of an arbitrary byte string (32 bytes).
///
/// This is the standard way to derive DHT keys: callers hash their
/// application-level identifiers and store under the digest, which keeps the
/// key distribution uniform across the 160-bit lookup space.
pub fn hash_key(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// 20-byte digest of an arbitrary byte string.
///
/// SHA-256 truncated to 160 bits, matching the node ID width.
pub fn short_digest(data: &[u8]) -> [u8; 20] {
    let full = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&full[..20]);
    out
}
