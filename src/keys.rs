//! Key Namespace
//!
//! Every key the cluster writes lives under `/<cluster>/<prefix>/...`.
//! Node-scoped keys end with the owning node's id so that a single
//! prefixed read returns the value for every node at once.

use crate::error::{Error, Result};

/// Name of the election inside the cluster namespace
pub const ELECTION_PREFIX: &str = "election";

/// Prefix for node-scoped state published through `put`
pub const STATE_DATA_PREFIX: &str = "state-data";

/// Prefix for node membership records
pub const NODES_PREFIX: &str = "nodes";

/// Key used by the tick agreement check
pub const TICK_KEY: &str = "tick";

/// Format a node-scoped key: `/<cluster>/<prefix>/<id>`
pub fn format_node_key(id: i64, cluster: &str, prefix: &str) -> String {
    format!("/{}/{}/{}", cluster, prefix, id)
}

/// Format the cluster-wide prefix `/<cluster>/<prefix>/` that matches
/// the node-scoped keys of every node
pub fn format_cluster_key(cluster: &str, prefix: &str) -> String {
    format!("/{}/{}/", cluster, prefix)
}

/// Name of the cluster's election
pub fn election_name(cluster: &str) -> String {
    format!("/{}/{}", cluster, ELECTION_PREFIX)
}

/// Prefix for a state-data key, relative to the cluster
pub fn state_data_prefix(key: &str) -> String {
    format!("{}/{}", STATE_DATA_PREFIX, key)
}

/// Split a node-scoped key into the owning node id and the key without the id
pub fn extract_node_id(key: &str) -> Result<(i64, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() < 2 {
        return Err(Error::InvalidKey(key.to_string()));
    }

    let (id_part, base) = parts.split_last().ok_or_else(|| Error::InvalidKey(key.to_string()))?;
    let id = id_part
        .parse::<i64>()
        .map_err(|_| Error::InvalidKey(key.to_string()))?;

    Ok((id, base.join("/")))
}
