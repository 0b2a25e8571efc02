//! Cluster Membership Records
//!
//! Role and metadata a node publishes about itself under the
//! membership prefix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Role has not been resolved for the current session
    #[default]
    Unknown,
    /// Node is the cluster leader
    Leader,
    /// Node is a follower
    Follower,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Unknown => write!(f, "Unknown"),
            NodeRole::Leader => write!(f, "Leader"),
            NodeRole::Follower => write!(f, "Follower"),
        }
    }
}

/// Metadata for a node that is persisted in the cluster state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Node identifier
    pub id: i64,
    /// Address other nodes use to reach this node
    pub address: String,
    /// When the node first resolved a role
    pub start: DateTime<Utc>,
    /// Current role
    pub role: NodeRole,
}

impl NodeMetadata {
    /// Decode a membership record
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode a membership record
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
