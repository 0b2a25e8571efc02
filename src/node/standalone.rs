//! Standalone Node
//!
//! A single-process [`Node`] for development and one-host deployments.
//! It is the leader from the moment it starts, runs both routines every
//! tick and keeps its state in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{effective_tick, Node, NodeRoutines};
use crate::error::{Error, Result};
use crate::keys::{extract_node_id, format_cluster_key, format_node_key, state_data_prefix};
use crate::state::{EventType, NodeMetadata, NodeRole, StateChangeEvent, KV};

/// Cluster name used for keys of a standalone node
pub const STANDALONE_CLUSTER: &str = "standalone";

/// Change notifications buffered per watcher
const EVENT_BUFFER: usize = 100;

struct Lifecycle {
    started: bool,
    closed: bool,
    shutdown: CancellationToken,
}

struct Inner {
    id: i64,
    address: String,
    tick: Duration,
    start: DateTime<Utc>,
    routines: Arc<dyn NodeRoutines>,
    kvs: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<StateChangeEvent>,
    lifecycle: Mutex<Lifecycle>,
    tasks: TaskTracker,
}

/// Node that needs no coordination store
#[derive(Clone)]
pub struct StandaloneNode {
    inner: Arc<Inner>,
}

impl StandaloneNode {
    pub fn new(
        id: i64,
        address: impl Into<String>,
        tick: Duration,
        routines: Arc<dyn NodeRoutines>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                id,
                address: address.into(),
                tick: effective_tick(tick),
                start: Utc::now(),
                routines,
                kvs: Mutex::new(BTreeMap::new()),
                events,
                lifecycle: Mutex::new(Lifecycle {
                    started: false,
                    closed: false,
                    shutdown: CancellationToken::new(),
                }),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Node identifier
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Always [`NodeRole::Leader`]
    pub fn role(&self) -> NodeRole {
        NodeRole::Leader
    }

    pub fn is_started(&self) -> bool {
        self.inner.lifecycle().started
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn kvs(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.kvs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        if self.lifecycle().closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn state_key(&self, key: &str) -> String {
        format_node_key(self.id, STANDALONE_CLUSTER, &state_data_prefix(key))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            id: self.id,
            address: self.address.clone(),
            start: self.start,
            role: NodeRole::Leader,
        }
    }

    fn emit(&self, event: StateChangeEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(node_id = self.id, "Standalone node is now Leader");

        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.routines.lead(shutdown.child_token()).await {
                tracing::error!(node_id = self.id, "Leader routine failed: {:#}", e);
            }
            if let Err(e) = self.routines.follow(shutdown.child_token()).await {
                tracing::error!(node_id = self.id, "Follower routine failed: {:#}", e);
            }
        }

        tracing::debug!(node_id = self.id, "Standalone loop exited");
    }
}

#[async_trait]
impl Node for StandaloneNode {
    fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.closed || lifecycle.started {
            return;
        }
        if lifecycle.shutdown.is_cancelled() {
            lifecycle.shutdown = CancellationToken::new();
        }
        lifecycle.started = true;

        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(inner.run(lifecycle.shutdown.clone()));
    }

    async fn stop(&self) {
        let shutdown = {
            let lifecycle = self.inner.lifecycle();
            if !lifecycle.started {
                return;
            }
            lifecycle.shutdown.clone()
        };

        shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();

        self.inner.lifecycle().started = false;
    }

    async fn close(&self) -> Result<()> {
        self.stop().await;

        let shutdown = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.closed = true;
            lifecycle.shutdown.clone()
        };
        shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.check_open()?;
        let key = self.inner.state_key(key);

        let previous = self.inner.kvs().insert(key.clone(), value.to_string());
        let event = match previous {
            None => StateChangeEvent {
                event_type: EventType::Added,
                node_id: self.inner.id,
                key,
                value: value.to_string(),
                old_key: String::new(),
                old_value: String::new(),
            },
            Some(old_value) => StateChangeEvent {
                event_type: EventType::Modified,
                node_id: self.inner.id,
                key: key.clone(),
                value: value.to_string(),
                old_key: key,
                old_value,
            },
        };
        self.inner.emit(event);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.check_open()?;
        let key = self.inner.state_key(key);
        Ok(self.inner.kvs().get(&key).cloned())
    }

    async fn get_as_node(&self, node_id: i64, key: &str) -> Result<Option<String>> {
        if node_id != self.inner.id {
            self.inner.check_open()?;
            return Ok(None);
        }
        self.get(key).await
    }

    async fn get_cluster(&self, key: &str) -> Result<HashMap<i64, Vec<KV>>> {
        self.inner.check_open()?;
        let prefix = format_cluster_key(STANDALONE_CLUSTER, &state_data_prefix(key));

        let mut values = Vec::new();
        for (k, v) in self.inner.kvs().range(prefix.clone()..) {
            if !k.starts_with(&prefix) {
                break;
            }
            let (_, base) = extract_node_id(k)?;
            values.push(KV {
                key: base,
                value: v.clone(),
            });
        }

        Ok(HashMap::from([(self.inner.id, values)]))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.check_open()?;
        let key = self.inner.state_key(key);

        let removed = self.inner.kvs().remove(&key);
        if let Some(old_value) = removed {
            self.inner.emit(StateChangeEvent {
                event_type: EventType::Deleted,
                node_id: self.inner.id,
                key: String::new(),
                value: String::new(),
                old_key: key,
                old_value,
            });
        }
        Ok(())
    }

    async fn watch_key_cluster(
        &self,
        token: CancellationToken,
        key: &str,
    ) -> Result<mpsc::Receiver<StateChangeEvent>> {
        self.inner.check_open()?;
        let prefix = format_cluster_key(STANDALONE_CLUSTER, &state_data_prefix(key));
        let mut events = self.inner.events.subscribe();
        let shutdown = self.inner.lifecycle().shutdown.clone();
        let (tx, rx) = mpsc::channel(1);
        let node_id = self.inner.id;

        self.inner.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };

                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(node_id, "Watch on {} missed {} events", prefix, missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                let key = if event.key.is_empty() { &event.old_key } else { &event.key };
                if !key.starts_with(&prefix) {
                    continue;
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn get_nodes(&self) -> Result<Vec<NodeMetadata>> {
        self.inner.check_open()?;
        Ok(vec![self.inner.metadata()])
    }

    async fn get_leader(&self) -> Result<Option<i64>> {
        self.inner.check_open()?;
        Ok(Some(self.inner.id))
    }

    fn get_self_metadata(&self) -> NodeMetadata {
        self.inner.metadata()
    }

    async fn get_node_metadata(&self, id: i64) -> Result<Option<NodeMetadata>> {
        self.inner.check_open()?;
        if id == self.inner.id {
            return Ok(Some(self.inner.metadata()));
        }
        Ok(None)
    }
}

impl std::fmt::Debug for StandaloneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaloneNode")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("started", &self.is_started())
            .finish()
    }
}
