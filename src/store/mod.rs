//! Coordination Store Contract
//!
//! The cluster engine only needs a small slice of a strongly-consistent
//! coordination service: TTL leases, an election bound to a lease, and
//! prefixed key reads, writes and watches. Backends implement the traits
//! in this module; [`MemoryStore`] is the in-process implementation used
//! by tests, the demo binary and single-host development.

mod memory;

pub use memory::{MemoryClient, MemoryStore};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Lease identifier handed out by the store
pub type LeaseId = i64;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Feed of current-leader values. `None` is an empty leader record.
pub type LeaderStream = BoxStream<'static, Option<String>>;

/// Feed of batched key changes
pub type WatchStream = BoxStream<'static, Vec<WatchEvent>>;

/// Coordination store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("store client closed")]
    Closed,

    #[error("session closed")]
    SessionClosed,

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors that may go away by retrying against a healthy connection
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable | StoreError::Closed)
    }
}

/// A key and its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Kind of a raw key change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A raw key change. `prev_kv` is filled when the key existed before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: Option<KeyValue>,
    pub prev_kv: Option<KeyValue>,
}

/// Connection to a coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that expires after `ttl_secs` without renewal
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseId>;

    /// Renew a lease once
    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Read a single key
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Read every key starting with `prefix`, ordered by key
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Write a key, optionally attached to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Watch every key starting with `prefix`, with previous values
    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;

    /// Open an election session bound to an existing lease
    async fn new_session(&self, lease: LeaseId) -> StoreResult<Arc<dyn Session>>;

    /// Cheap health check
    async fn health_check(&self) -> StoreResult<()>;

    /// Release the connection
    async fn close(&self) -> StoreResult<()>;
}

/// One participation in elections, bound to a lease
#[async_trait]
pub trait Session: Send + Sync {
    /// Lease backing the session
    fn lease(&self) -> LeaseId;

    /// Election named `name` scoped to this session
    fn election(&self, name: &str) -> Arc<dyn Election>;

    /// Close the session, revoking its lease
    async fn close(&self) -> StoreResult<()>;
}

/// A named contest with at most one current leader value
#[async_trait]
pub trait Election: Send + Sync {
    /// Offer `value` as a candidate and wait until it is the leader
    async fn campaign(&self, value: &str) -> StoreResult<()>;

    /// Feed of the current leader value, ending when the session ends
    async fn observe(&self) -> StoreResult<LeaderStream>;

    /// Give up leadership (or candidacy) held by this session
    async fn resign(&self) -> StoreResult<()>;

    /// Current leader value, `None` when nobody leads
    async fn leader(&self) -> StoreResult<Option<String>>;
}

/// Creates store connections
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> StoreResult<Arc<dyn CoordinationStore>>;
}
