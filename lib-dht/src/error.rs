//! DHT error types.

use thiserror::Error;

/// Errors surfaced by the DHT layer.
///
/// Most network trouble never reaches callers: timeouts and unreachable
/// peers are absorbed by the engine and show up as `failed_pings` instead.
/// What remains is the small set applications actually branch on.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Exhaustive iterative lookup finished without finding the value.
    #[error("value not found for key {key}")]
    ValueNotFound { key: String },

    /// The target could not be reached via routing plus iterative search.
    #[error("node {target} not found")]
    NodeNotFound { target: String },

    /// No reply within the deadline for one RPC.
    #[error("request timed out")]
    Timeout,

    /// The node is stopping; outstanding requests were drained.
    #[error("node is shutting down")]
    ShuttingDown,

    /// An encoded message would not fit in a single UDP datagram.
    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("wire encoding failed: {0}")]
    Encode(String),

    #[error("wire decoding failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Storage(#[from] lib_storage::StorageError),

    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}
