//! Storage error types.

use thiserror::Error;

/// Errors surfaced by the local store.
///
/// Neither kind aborts the node: callers log and report them, and the DHT
/// layer turns a failed remote `put` into an error reply instead of a crash.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store is over its configured byte cap and the entry does not fit
    /// even after sweeping expired data.
    #[error("storage capacity exceeded: {needed} bytes needed, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    /// Backend I/O failure while reading or writing a snapshot.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("storage snapshot error: {0}")]
    Snapshot(String),
}
