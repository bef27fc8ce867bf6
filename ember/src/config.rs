//! Node configuration.
//!
//! Loaded from YAML; every section and key is optional and falls back to
//! its default. An explicitly passed config path must exist and parse, a
//! missing default path just means defaults.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Role a node plays in the network. Types differ only in resource caps
/// and whether the global-ranking loop runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Long-lived node that also aggregates the global ranking.
    Seed,
    /// Default role.
    #[default]
    Full,
    /// Storage capped at 1 GiB.
    Light,
    /// Storage capped at 100 MiB, k reduced to 10.
    Mobile,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Seed => "seed",
            NodeType::Full => "full",
            NodeType::Light => "light",
            NodeType::Mobile => "mobile",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// k-bucket size and replication factor.
    pub k: usize,
    /// Lookup concurrency.
    pub alpha: usize,
    pub node_id_bits: usize,
    pub bucket_count: usize,
    /// Bucket refresh interval, seconds.
    pub refresh_interval: u64,
    /// PING timeout, seconds.
    pub ping_timeout: f64,
    /// General RPC timeout, seconds.
    pub request_timeout: f64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            node_id_bits: 160,
            bucket_count: 160,
            refresh_interval: 3600,
            ping_timeout: 5.0,
            request_timeout: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Total byte cap for the local store.
    pub max_storage_size: u64,
    /// Seconds.
    pub default_ttl: u64,
    pub popular_ttl: u64,
    pub active_ttl: u64,
    pub private_ttl: u64,
    pub min_guaranteed_ttl: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            max_storage_size: 10 * 1024 * 1024 * 1024,
            default_ttl: 86_400,
            popular_ttl: 2_592_000,
            active_ttl: 604_800,
            private_ttl: 10_800,
            min_guaranteed_ttl: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// `host:port` endpoints to contact at startup.
    pub bootstrap_nodes: Vec<String>,
    pub max_connections: usize,
    pub connection_timeout: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: 8468,
            bootstrap_nodes: Vec::new(),
            max_connections: 100,
            connection_timeout: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_type: NodeType,
    pub auto_detect_type: bool,
    /// 20 raw bytes; relative paths resolve under `storage.data_dir`.
    pub node_id_file: String,
    pub state_file: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_type: NodeType::Full,
            auto_detect_type: true,
            node_id_file: "node_id.bin".into(),
            state_file: "node_state.bin".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopularityConfig {
    /// Ranking recompute interval, seconds.
    pub update_interval: u64,
    /// Top-N gossip interval, seconds.
    pub exchange_interval: u64,
    /// Seed consensus interval, seconds.
    pub global_update_interval: u64,
    pub popularity_threshold: f64,
    pub active_threshold: f64,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            update_interval: 3600,
            exchange_interval: 21_600,
            global_update_interval: 10_800,
            popularity_threshold: 7.0,
            active_threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Global inbound window cap.
    pub rate_limit_requests: usize,
    /// Window length, seconds.
    pub rate_limit_window: u64,
    /// Per-sender cap within the window.
    pub rate_limit_per_node: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_requests: 100,
            rate_limit_window: 60,
            rate_limit_per_node: 20,
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dht: DhtConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub node: NodeConfig,
    pub popularity: PopularityConfig,
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// With an explicit path, failure to read or parse is fatal. Without
    /// one, `config.yaml` is used when present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new("config.yaml");
                if fallback.exists() {
                    Self::from_file(fallback)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Apply the resource caps implied by the node type.
    pub fn apply_node_type_limits(&mut self) {
        match self.node.node_type {
            NodeType::Light => {
                self.storage.max_storage_size =
                    self.storage.max_storage_size.min(1024 * 1024 * 1024);
            }
            NodeType::Mobile => {
                self.storage.max_storage_size =
                    self.storage.max_storage_size.min(100 * 1024 * 1024);
                self.dht.k = self.dht.k.min(10);
            }
            NodeType::Seed | NodeType::Full => {}
        }
    }
}
