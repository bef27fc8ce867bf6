//! Ember DHT Core
//!
//! The networked heart of an Ember node: a Kademlia-style distributed hash
//! table over UDP with a popularity layer on top.
//!
//! - XOR-metric routing table of LRU k-buckets ([`routing`])
//! - CBOR wire envelopes with request/reply correlation ([`wire`], [`protocol`])
//! - Iterative, α-parallel lookups and STORE fan-out ([`engine`])
//! - Inbound rate limiting keyed by sender node ID ([`rate_limit`])
//! - Popularity gossip and seed-node consensus ranking ([`exchange`])
//! - Popularity-driven re-replication ([`replicate`])
//!
//! Every RPC failure is absorbed here: timeouts become `failed_pings` on the
//! peer and absent candidates in the next lookup iteration. Only exhaustive
//! lookup failure and storage errors surface to callers.

pub mod distance;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod peer;
pub mod protocol;
pub mod rate_limit;
pub mod replicate;
pub mod routing;
pub mod transport;
pub mod wire;

pub use distance::{bucket_index, target_for_key, xor_distance, Distance, BUCKET_COUNT};
pub use engine::DhtEngine;
pub use error::DhtError;
pub use exchange::PopularityExchanger;
pub use peer::Peer;
pub use protocol::{NetworkProtocol, ProtocolConfig};
pub use rate_limit::RateLimiter;
pub use replicate::Replicator;
pub use routing::{KBucket, RoutingStats, RoutingTable};
pub use transport::UdpTransport;
pub use wire::{Envelope, ExchangeItem, MessageKind, NodeEntry, Payload, MAX_DATAGRAM};
