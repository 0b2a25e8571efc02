//! Node Module
//!
//! The [`Node`] contract shared by the store-backed [`ClusterNode`] and
//! the single-process [`StandaloneNode`], and the routines a node runs on
//! every tick.

mod cluster;
mod standalone;

pub use cluster::{ClusterNode, ClusterNodeOptions};
pub use standalone::StandaloneNode;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::state::{NodeMetadata, StateChangeEvent, KV};

/// Shortest routine tick a node runs with
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Raise a zero tick to [`MIN_TICK`]; tokio intervals need a positive period
pub(crate) fn effective_tick(tick: Duration) -> Duration {
    if tick.is_zero() {
        tracing::warn!("Routine tick must be positive - using {:?}", MIN_TICK);
        return MIN_TICK;
    }
    tick
}

/// Work a node performs once per tick, depending on its role.
///
/// Both routines should return quickly when `token` is cancelled and
/// cover exactly one execution cycle. Anything that must run less often
/// than the tick has to track its own schedule and skip cycles.
#[async_trait]
pub trait NodeRoutines: Send + Sync + 'static {
    /// Called every tick while the node is the leader
    async fn lead(&self, token: CancellationToken) -> anyhow::Result<()>;

    /// Called every tick while the node is a follower
    async fn follow(&self, token: CancellationToken) -> anyhow::Result<()>;
}

/// [`NodeRoutines`] built from a pair of closures
pub struct RoutineFns<L, F> {
    leader: L,
    follower: F,
}

impl<L, LFut, F, FFut> RoutineFns<L, F>
where
    L: Fn(CancellationToken) -> LFut + Send + Sync + 'static,
    LFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    F: Fn(CancellationToken) -> FFut + Send + Sync + 'static,
    FFut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(leader: L, follower: F) -> Self {
        Self { leader, follower }
    }
}

#[async_trait]
impl<L, LFut, F, FFut> NodeRoutines for RoutineFns<L, F>
where
    L: Fn(CancellationToken) -> LFut + Send + Sync + 'static,
    LFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    F: Fn(CancellationToken) -> FFut + Send + Sync + 'static,
    FFut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn lead(&self, token: CancellationToken) -> anyhow::Result<()> {
        (self.leader)(token).await
    }

    async fn follow(&self, token: CancellationToken) -> anyhow::Result<()> {
        (self.follower)(token).await
    }
}

/// A member of a cluster
#[async_trait]
pub trait Node: Send + Sync {
    /// Join the cluster and begin campaigning for leadership in the
    /// background. Calling start on a running node does nothing.
    fn start(&self);

    /// Leave the cluster gracefully, resigning first when leader. The
    /// store connection is kept so the node can be started again.
    async fn stop(&self);

    /// Stop the node and release its store connection. A closed node
    /// cannot be restarted.
    async fn close(&self) -> Result<()>;

    /// Write a key bound to this node. It disappears when the node's
    /// lease runs out.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Read one of this node's keys
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read a key published by another node
    async fn get_as_node(&self, node_id: i64, key: &str) -> Result<Option<String>>;

    /// Values of `key` for every node in the cluster, keyed by node id.
    /// Every member appears, with an empty vector when it has no value.
    async fn get_cluster(&self, key: &str) -> Result<HashMap<i64, Vec<KV>>>;

    /// Remove one of this node's keys. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Stream changes of `key` across the whole cluster until `token` or
    /// the node itself stops
    async fn watch_key_cluster(
        &self,
        token: CancellationToken,
        key: &str,
    ) -> Result<mpsc::Receiver<StateChangeEvent>>;

    /// Membership records of every node in the cluster
    async fn get_nodes(&self) -> Result<Vec<NodeMetadata>>;

    /// Id of the current leader, `None` when nobody leads
    async fn get_leader(&self) -> Result<Option<i64>>;

    /// This node's own metadata
    fn get_self_metadata(&self) -> NodeMetadata;

    /// Membership record of another node, `None` when it is not a member
    async fn get_node_metadata(&self, id: i64) -> Result<Option<NodeMetadata>>;
}
