//! XOR distance metric and bucket indexing.
//!
//! Distances are 20-byte big-endian unsigned integers; lexicographic
//! comparison of the raw bytes is the numeric order.

use lib_crypto::{NodeId, NODE_ID_LEN};

/// Number of k-buckets, one per possible leading-differing-bit position.
pub const BUCKET_COUNT: usize = 160;

/// XOR distance between two node IDs.
pub type Distance = [u8; NODE_ID_LEN];

/// `dist(a, b) = a XOR b`.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; NODE_ID_LEN];
    for (i, (x, y)) in a.as_bytes().iter().zip(b.as_bytes()).enumerate() {
        out[i] = x ^ y;
    }
    out
}

/// Bucket index for `other` relative to `local`: the position of the most
/// significant differing bit. 0 is the farthest bucket, 159 the closest;
/// zero distance (only possible for self, which is never stored) maps to
/// the last bucket.
pub fn bucket_index(local: &NodeId, other: &NodeId) -> usize {
    let distance = xor_distance(local, other);
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    return i * 8 + bit;
                }
            }
        }
    }
    BUCKET_COUNT - 1
}

/// Lookup target for a DHT key: the first 20 bytes, zero-padded when the
/// key is shorter. Callers are expected to pass hash-derived keys so the
/// prefix is uniformly distributed.
pub fn target_for_key(key: &[u8]) -> NodeId {
    let mut id = [0u8; NODE_ID_LEN];
    let n = key.len().min(NODE_ID_LEN);
    id[..n].copy_from_slice(&key[..n]);
    NodeId::from_bytes(id)
}
