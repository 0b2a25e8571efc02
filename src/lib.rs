//! WolfCluster - Leader Election and Shared Node State
//!
//! A cluster node coordination engine built on a lease-based, strongly
//! consistent coordination store. Every node keeps a lease alive,
//! campaigns in a single cluster-wide election, and runs a leader or
//! follower routine on a fixed tick depending on the outcome.
//!
//! # Architecture
//!
//! A node's liveness is its lease: membership records and every value it
//! publishes are attached to the lease, so a node that stops renewing
//! disappears from the cluster without anyone cleaning up after it.
//! Whenever a node loses track of the cluster it drops its session and
//! rejoins from scratch.
//!
//! # Features
//!
//! - At most one leader, followed by every other healthy node
//! - Graceful handoff on stop, automatic failover on crash
//! - Agreement check on the routine tick before a node takes a role
//! - Node-scoped key/value state with cluster-wide reads and watches
//! - Standalone mode for single-process deployments
//! - In-memory coordination store for tests and development

pub mod backoff;
pub mod config;
pub mod error;
pub mod keys;
pub mod node;
pub mod state;
pub mod store;

pub use config::WolfClusterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfClusterConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{
        ClusterNode, ClusterNodeOptions, Node, NodeRoutines, RoutineFns, StandaloneNode,
    };
    pub use crate::state::{EventType, NodeMetadata, NodeRole, StateChangeEvent, KV};
    pub use crate::store::{CoordinationStore, MemoryStore, StoreConnector};
}
