//! WolfSync Configuration
//!
//! This module provides configuration structures for a WolfSync node:
//! its identity, the static peer table, timing and retry policy, and the
//! HTTP front-end.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Full peer table, including this node, keyed by node name
    pub peers: BTreeMap<String, PeerConfig>,

    /// Timing and retry policy
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's name in the peer table
    pub name: String,

    /// Address to bind for node-to-node traffic (defaults to 0.0.0.0:<own port>)
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Directory holding the replicated files
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,

    /// Directory for the operation log and offline state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// One entry of the static peer table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,
    pub port: u16,
}

/// A named peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl Peer {
    /// host:port for connecting
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Timing and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Heartbeat broadcast interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is considered down, in milliseconds
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Per-attempt RPC timeout in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// RPC attempts before a peer is marked unreachable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait between RPC attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Interval of the offline-drain + anti-entropy cycle in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Largest file accepted for a direct transfer
    #[serde(default = "default_max_direct_transfer_bytes")]
    pub max_direct_transfer_bytes: usize,

    /// Largest wire frame accepted
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_shared_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfsync/files")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfsync/state")
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_node_timeout_ms() -> u64 {
    30_000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_max_direct_transfer_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            max_direct_transfer_bytes: default_max_direct_transfer_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if !self.peers.contains_key(&self.node.name) {
            return Err(crate::Error::Config(format!(
                "node.name '{}' is not in the peer table",
                self.node.name
            )));
        }

        for (name, peer) in &self.peers {
            if peer.address.is_empty() {
                return Err(crate::Error::Config(format!("peers.{}.address cannot be empty", name)));
            }
            if peer.port == 0 {
                return Err(crate::Error::Config(format!("peers.{}.port cannot be 0", name)));
            }
        }

        let c = &self.cluster;
        if c.heartbeat_interval_ms == 0 || c.node_timeout_ms == 0 || c.rpc_timeout_ms == 0 {
            return Err(crate::Error::Config("cluster intervals must be non-zero".into()));
        }
        if c.max_retries == 0 {
            return Err(crate::Error::Config("cluster.max_retries must be at least 1".into()));
        }
        if c.sync_interval_ms == 0 {
            return Err(crate::Error::Config("cluster.sync_interval_ms must be non-zero".into()));
        }

        Ok(())
    }

    /// Every peer in the table, including this node
    pub fn peer_table(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .map(|(name, p)| Peer {
                name: name.clone(),
                address: p.address.clone(),
                port: p.port,
            })
            .collect()
    }

    /// Address to bind for node-to-node traffic
    pub fn bind_address(&self) -> String {
        match &self.node.bind_address {
            Some(addr) => addr.clone(),
            None => {
                let port = self
                    .peers
                    .get(&self.node.name)
                    .map(|p| p.port)
                    .unwrap_or(9090);
                format!("0.0.0.0:{}", port)
            }
        }
    }

    /// Get the operation log path
    pub fn oplog_path(&self) -> PathBuf {
        self.node.data_dir.join(crate::oplog::LOG_FILE_NAME)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get liveness timeout as Duration
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.node_timeout_ms)
    }

    /// Get per-attempt RPC timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.rpc_timeout_ms)
    }

    /// Get backoff between RPC attempts as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.cluster.retry_backoff_ms)
    }

    /// Get periodic cycle interval as Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.sync_interval_ms)
    }
}

/// Sample configuration written by `wolfsync init`
pub fn sample_config(node_name: &str) -> String {
    format!(
        r#"# WolfSync Configuration
# Every node carries the same [peers] table; only [node].name differs.

[node]
name = "{name}"
shared_dir = "/var/lib/wolfsync/files"
data_dir = "/var/lib/wolfsync/state"

[peers.{name}]
address = "10.0.0.1"
port = 9090

[peers.node-2]
address = "10.0.0.2"
port = 9090

[peers.node-3]
address = "10.0.0.3"
port = 9090

[cluster]
heartbeat_interval_ms = 10000
node_timeout_ms = 30000
rpc_timeout_ms = 10000
max_retries = 3
retry_backoff_ms = 1000
sync_interval_ms = 30000
max_direct_transfer_bytes = 10485760

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
"#,
        name = node_name
    )
}
