//! Ember Network Node
//!
//! The orchestrator tying the Ember libraries into a running node: YAML
//! configuration, node identity, the DHT protocol stack, the popularity
//! engine, and the background loops that keep all of it maintained.
//!
//! Construction order is deliberate and acyclic: store, routing table,
//! transport, protocol, engine, metrics, ranker, exchanger, replicator,
//! then the supervisor. The one back-reference (protocol needs the
//! exchanger to answer popularity RPCs) is closed with a single
//! post-construction hook.

pub mod config;
pub mod node;

pub use config::{Config, NodeType};
pub use node::Node;
