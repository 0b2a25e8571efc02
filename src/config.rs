//! WolfCluster Configuration
//!
//! This module provides configuration structures for a cluster node:
//! identity, cluster membership, coordination store connection and
//! logging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Main WolfCluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfClusterConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: i64,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// How the node participates in a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Elect a leader through the coordination store
    Cluster,
    /// Single process, leader forever
    Standalone,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, the root of every key the node writes
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Cluster or standalone operation
    #[serde(default = "default_mode")]
    pub mode: ClusterMode,

    /// Lease TTL in milliseconds (rounded down to whole seconds, minimum 1s)
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Interval between leader/follower routine executions in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Reconnect loop backoff floor in milliseconds
    #[serde(default = "default_retry_floor_ms")]
    pub retry_floor_ms: u64,

    /// Reconnect loop backoff ceiling in milliseconds
    #[serde(default = "default_retry_ceiling_ms")]
    pub retry_ceiling_ms: u64,

    /// Operating loop backoff ceiling in milliseconds
    #[serde(default = "default_session_retry_ceiling_ms")]
    pub session_retry_ceiling_ms: u64,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Store endpoints (host:port)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Upper bound on a single store request in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_cluster_name() -> String {
    "wolfcluster".to_string()
}

fn default_mode() -> ClusterMode {
    ClusterMode::Cluster
}

fn default_lease_ttl_ms() -> u64 {
    5000
}

fn default_tick_ms() -> u64 {
    50
}

fn default_retry_floor_ms() -> u64 {
    10
}

fn default_retry_ceiling_ms() -> u64 {
    3000
}

fn default_session_retry_ceiling_ms() -> u64 {
    1000
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            mode: default_mode(),
            lease_ttl_ms: default_lease_ttl_ms(),
            tick_ms: default_tick_ms(),
            retry_floor_ms: default_retry_floor_ms(),
            retry_ceiling_ms: default_retry_ceiling_ms(),
            session_retry_ceiling_ms: default_session_retry_ceiling_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: Vec::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
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

impl WolfClusterConfig {
    /// Configuration for a node with every other setting at its default
    pub fn for_node(id: i64, bind_address: &str) -> Self {
        Self {
            node: NodeConfig {
                id,
                bind_address: bind_address.to_string(),
                advertise_address: None,
            },
            cluster: ClusterConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.name.is_empty() || self.cluster.name.contains('/') {
            return Err(crate::Error::Config(
                "cluster.name must be non-empty and cannot contain '/'".into(),
            ));
        }

        if self.cluster.tick_ms == 0 {
            return Err(crate::Error::Config("cluster.tick_ms must be positive".into()));
        }

        if self.cluster.retry_floor_ms > self.cluster.retry_ceiling_ms {
            return Err(crate::Error::Config(
                "cluster.retry_floor_ms cannot exceed cluster.retry_ceiling_ms".into(),
            ));
        }

        if self.cluster.mode == ClusterMode::Cluster && self.store.backend != "memory" {
            return Err(crate::Error::Config(format!(
                "unsupported store backend: {}",
                self.store.backend
            )));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get lease TTL as Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.cluster.lease_ttl_ms)
    }

    /// Get routine tick as Duration
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.cluster.tick_ms)
    }

    /// Get the store request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.store.request_timeout_ms)
    }

    /// Get the store connection timeout as Duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.store.dial_timeout_ms)
    }

    /// Backoff for the reconnect loop
    pub fn outer_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.cluster.retry_floor_ms),
            Duration::from_millis(self.cluster.retry_ceiling_ms),
        )
    }

    /// Backoff for the operating loop
    pub fn inner_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.cluster.retry_floor_ms),
            Duration::from_millis(
                self.cluster
                    .session_retry_ceiling_ms
                    .max(self.cluster.retry_floor_ms),
            ),
        )
    }
}
