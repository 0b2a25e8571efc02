//! WolfCluster Error Types

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for WolfCluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCluster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Coordination store errors
    #[error("Store operation '{op}' failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Store operation '{0}' timed out")]
    Timeout(&'static str),

    // Precondition errors
    #[error("no lease")]
    NoLease,

    #[error("Node is not part of a cluster - call start to join the cluster")]
    NotJoined,

    #[error("Node is closed")]
    Closed,

    // Consistency errors
    #[error("cluster tick disagreement: local tick is {local}ns, node {node_id} reports {remote:?}")]
    ClusterTickDisagreement {
        local: u128,
        node_id: i64,
        remote: Option<String>,
    },

    #[error("Failed to parse leader id: {0:?}")]
    InvalidLeaderId(String),

    #[error("Failed to parse id from key: {0:?}")]
    InvalidKey(String),

    // Serialization errors
    #[error("Node metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a store failure with the operation that produced it
    pub fn store(op: &'static str, source: StoreError) -> Self {
        Error::Store { op, source }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Store { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Check if this error should tear down the current session and force a re-election
    pub fn forces_reelection(&self) -> bool {
        matches!(
            self,
            Error::ClusterTickDisagreement { .. } | Error::InvalidLeaderId(_)
        ) || self.is_retryable()
    }
}
