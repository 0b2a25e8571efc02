//! Cluster Node
//!
//! A node that elects a leader through the coordination store.
//!
//! Each node runs one background state loop. The outer part grants a
//! lease, opens an election session on it and hands over to the operating
//! loop; the operating loop campaigns, renews the lease, follows the
//! election's leader feed and runs the leader or follower routine on a
//! fixed tick. Anything that makes the node lose track of the cluster
//! (failed renewal, closed leader feed, bad leader value, tick
//! disagreement, too long without a role) cancels the session, which
//! cleans up and starts the sequence again.
//!
//! Cancellation is a three level tree: the engine token (cancelled by
//! `stop`), a session token per lease, and a generation token per role
//! that the campaigner and routines run under. The generation token is a
//! child of the session token so a role change never tears down the
//! session, while losing the session always stops the campaigner.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{effective_tick, Node, NodeRoutines};
use crate::backoff::BackoffPolicy;
use crate::config::WolfClusterConfig;
use crate::error::{Error, Result};
use crate::keys::{
    election_name, extract_node_id, format_cluster_key, format_node_key, state_data_prefix,
    NODES_PREFIX, TICK_KEY,
};
use crate::state::{NodeMetadata, NodeRole, StateChangeEvent, KV};
use crate::store::{
    CoordinationStore, Election, LeaderStream, LeaseId, Session, StoreConnector, StoreResult,
};

/// Interval between lease renewals
pub const LEASE_RENEW_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between campaign attempts, also the bound on each attempt
pub const CAMPAIGN_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on each store call made during cleanup
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Ticks a node may spend without a role before it forces a re-election
pub const MAX_UNKNOWN_TICKS: u32 = 100;

/// Log the unknown role only every this many loop iterations
const UNKNOWN_LOG_EVERY: u64 = 20;

/// Options for a cluster node
#[derive(Clone)]
pub struct ClusterNodeOptions {
    /// Node identifier, also the value the node campaigns with
    pub id: i64,
    /// Address published in the node's metadata
    pub address: String,
    /// Lease TTL, rounded down to whole seconds with a minimum of one
    pub ttl: Duration,
    /// Cluster name, the root of every key
    pub cluster_name: String,
    /// Interval between routine executions; must agree across the cluster.
    /// Zero is raised to [`MIN_TICK`](super::MIN_TICK).
    pub tick: Duration,
    /// Bound on a single store request
    pub request_timeout: Duration,
    /// Bound on opening a store connection
    pub dial_timeout: Duration,
    /// Backoff of the reconnect loop
    pub outer_backoff: BackoffPolicy,
    /// Backoff of the operating loop
    pub inner_backoff: BackoffPolicy,
    /// Opens store connections
    pub connector: Arc<dyn StoreConnector>,
    /// Leader and follower routines
    pub routines: Arc<dyn NodeRoutines>,
}

impl ClusterNodeOptions {
    /// Options with default timings
    pub fn new(
        id: i64,
        address: impl Into<String>,
        cluster_name: impl Into<String>,
        connector: Arc<dyn StoreConnector>,
        routines: Arc<dyn NodeRoutines>,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            ttl: Duration::from_secs(5),
            cluster_name: cluster_name.into(),
            tick: Duration::from_millis(50),
            request_timeout: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(3),
            outer_backoff: BackoffPolicy::outer(),
            inner_backoff: BackoffPolicy::inner(),
            connector,
            routines,
        }
    }

    /// Options taken from a loaded configuration
    pub fn from_config(
        config: &WolfClusterConfig,
        connector: Arc<dyn StoreConnector>,
        routines: Arc<dyn NodeRoutines>,
    ) -> Self {
        Self {
            id: config.node.id,
            address: config.advertise_address().to_string(),
            ttl: config.lease_ttl(),
            cluster_name: config.cluster.name.clone(),
            tick: config.tick(),
            request_timeout: config.request_timeout(),
            dial_timeout: config.dial_timeout(),
            outer_backoff: config.outer_backoff(),
            inner_backoff: config.inner_backoff(),
            connector,
            routines,
        }
    }
}

/// Mutable node state. Never held across an await.
struct NodeState {
    role: NodeRole,
    start: DateTime<Utc>,
    tick: Duration,
    lease: Option<LeaseId>,
    session: Option<Arc<dyn Session>>,
    election: Option<Arc<dyn Election>>,
    generation: Option<CancellationToken>,
}

struct Lifecycle {
    started: bool,
    closed: bool,
    shutdown: CancellationToken,
}

struct Inner {
    id: i64,
    address: String,
    ttl: Duration,
    cluster_name: String,
    request_timeout: Duration,
    dial_timeout: Duration,
    outer_backoff: BackoffPolicy,
    inner_backoff: BackoffPolicy,
    connector: Arc<dyn StoreConnector>,
    routines: Arc<dyn NodeRoutines>,
    client: RwLock<Option<Arc<dyn CoordinationStore>>>,
    state: Mutex<NodeState>,
    /// Serializes role transitions and cleanup
    transition: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    /// State loop, routine invocations and watch forwarders
    tasks: TaskTracker,
    campaigns: TaskTracker,
}

/// Node in a distributed cluster capable of handling leader elections
#[derive(Clone)]
pub struct ClusterNode {
    inner: Arc<Inner>,
}

impl ClusterNode {
    /// Create a node. Nothing touches the store until [`Node::start`].
    pub fn new(opts: ClusterNodeOptions) -> Self {
        let inner = Inner {
            id: opts.id,
            address: opts.address,
            ttl: opts.ttl,
            cluster_name: opts.cluster_name,
            request_timeout: opts.request_timeout,
            dial_timeout: opts.dial_timeout,
            outer_backoff: opts.outer_backoff,
            inner_backoff: opts.inner_backoff,
            connector: opts.connector,
            routines: opts.routines,
            client: RwLock::new(None),
            state: Mutex::new(NodeState {
                role: NodeRole::Unknown,
                // stamped when the node first resolves a role
                start: DateTime::<Utc>::UNIX_EPOCH,
                tick: effective_tick(opts.tick),
                lease: None,
                session: None,
                election: None,
                generation: None,
            }),
            transition: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                started: false,
                closed: false,
                shutdown: CancellationToken::new(),
            }),
            tasks: TaskTracker::new(),
            campaigns: TaskTracker::new(),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Node identifier
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Current role
    pub fn role(&self) -> NodeRole {
        self.inner.state().role
    }

    /// Configured routine tick
    pub fn tick(&self) -> Duration {
        self.inner.tick()
    }

    /// Change the routine tick. The new value is published with the next
    /// role change and the ticker is reset after it. A zero tick is raised
    /// to [`MIN_TICK`](super::MIN_TICK).
    pub fn set_tick(&self, tick: Duration) {
        self.inner.state().tick = effective_tick(tick);
    }

    /// Whether the background state loop is running
    pub fn is_started(&self) -> bool {
        self.inner.lifecycle().started
    }
}

#[async_trait]
impl Node for ClusterNode {
    fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.closed {
            tracing::warn!(node_id = self.inner.id, "Ignoring start of a closed node");
            return;
        }
        if lifecycle.started {
            return;
        }

        if lifecycle.shutdown.is_cancelled() {
            lifecycle.shutdown = CancellationToken::new();
        }
        lifecycle.started = true;

        let shutdown = lifecycle.shutdown.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(inner.state_loop(shutdown));
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
        self.inner.wait_for_tasks().await;

        self.inner.lifecycle().started = false;
    }

    async fn close(&self) -> Result<()> {
        self.stop().await;

        // watchers may outlive a node that was never started
        let shutdown = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.closed = true;
            lifecycle.shutdown.clone()
        };
        shutdown.cancel();
        self.inner.wait_for_tasks().await;

        let client = self.inner.client.write().await.take();
        if let Some(client) = client {
            client.close().await.map_err(|e| Error::store("close", e))?;
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let lease = self.inner.state().lease.ok_or(Error::NoLease)?;
        let client = self.inner.client().await?;
        let key = self.inner.state_key(self.inner.id, key);
        self.inner
            .bounded("put", client.put(&key, value, Some(lease)))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_as_node(self.inner.id, key).await
    }

    async fn get_as_node(&self, node_id: i64, key: &str) -> Result<Option<String>> {
        let client = self.inner.client().await?;
        let key = self.inner.state_key(node_id, key);
        let pair = self.inner.bounded("get", client.get(&key)).await?;
        Ok(pair.map(|kv| kv.value))
    }

    async fn get_cluster(&self, key: &str) -> Result<HashMap<i64, Vec<KV>>> {
        let client = self.inner.client().await?;
        self.inner.cluster_values(&client, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let client = self.inner.client().await?;
        let key = self.inner.state_key(self.inner.id, key);
        self.inner.bounded("delete", client.delete(&key)).await
    }

    async fn watch_key_cluster(
        &self,
        token: CancellationToken,
        key: &str,
    ) -> Result<mpsc::Receiver<StateChangeEvent>> {
        let client = self.inner.client().await?;
        let prefix = format_cluster_key(&self.inner.cluster_name, &state_data_prefix(key));
        let mut watch = self.inner.bounded("watch", client.watch_prefix(&prefix)).await?;

        let (tx, rx) = mpsc::channel(1);
        let shutdown = self.inner.lifecycle().shutdown.clone();
        let node_id = self.inner.id;

        self.inner.tasks.spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    batch = watch.next() => batch,
                };
                let Some(batch) = batch else {
                    return;
                };

                for raw in batch {
                    let event = match StateChangeEvent::from_watch(&raw) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::error!(
                                node_id,
                                "Failed to extract node id from watch event: {}",
                                e
                            );
                            continue;
                        }
                    };

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
            }
        });

        Ok(rx)
    }

    async fn get_nodes(&self) -> Result<Vec<NodeMetadata>> {
        let client = self.inner.client().await?;
        self.inner.nodes(&client).await
    }

    async fn get_leader(&self) -> Result<Option<i64>> {
        let election = self.inner.state().election.clone();
        let election = election.ok_or(Error::NotJoined)?;

        match self.inner.bounded("leader", election.leader()).await? {
            None => Ok(None),
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::InvalidLeaderId(value)),
        }
    }

    fn get_self_metadata(&self) -> NodeMetadata {
        self.inner.metadata()
    }

    async fn get_node_metadata(&self, id: i64) -> Result<Option<NodeMetadata>> {
        let client = self.inner.client().await?;
        let key = format_node_key(id, &self.inner.cluster_name, NODES_PREFIX);
        match self.inner.bounded("get", client.get(&key)).await? {
            Some(kv) => Ok(Some(NodeMetadata::from_json(kv.value.as_bytes())?)),
            None => Ok(None),
        }
    }
}

/// Run a store call with an upper bound on its duration
async fn bounded<T>(
    timeout: Duration,
    op: &'static str,
    call: impl Future<Output = StoreResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(|e| Error::store(op, e)),
        Err(_) => Err(Error::Timeout(op)),
    }
}

/// Lease TTL in whole seconds, at least one
fn lease_ttl_secs(ttl: Duration) -> i64 {
    (ttl.as_secs() as i64).max(1)
}

/// Campaign for leadership once per interval until the token is cancelled
async fn campaign(node_id: i64, token: CancellationToken, election: Arc<dyn Election>) {
    let candidate = node_id.to_string();
    let mut ticker = tokio::time::interval(CAMPAIGN_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = token.cancelled() => return,
            attempt = tokio::time::timeout(CAMPAIGN_INTERVAL, election.campaign(&candidate)) => {
                if let Ok(Err(e)) = attempt {
                    tracing::trace!(node_id, "Campaign attempt failed: {}", e);
                }
            }
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick(&self) -> Duration {
        self.state().tick
    }

    fn metadata(&self) -> NodeMetadata {
        let state = self.state();
        NodeMetadata {
            id: self.id,
            address: self.address.clone(),
            start: state.start,
            role: state.role,
        }
    }

    /// Log a failure the state loops recover from by starting over
    fn log_failure(&self, context: &str, e: &Error) {
        if e.is_retryable() {
            tracing::warn!(node_id = self.id, "{} - retrying: {}", context, e);
        } else {
            tracing::error!(node_id = self.id, "{}: {}", context, e);
        }
    }

    fn state_key(&self, node_id: i64, key: &str) -> String {
        format_node_key(node_id, &self.cluster_name, &state_data_prefix(key))
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> Result<T> {
        bounded(self.request_timeout, op, call).await
    }

    async fn wait_for_tasks(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        self.campaigns.close();
        self.campaigns.wait().await;
        self.campaigns.reopen();
    }

    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
        bounded(self.dial_timeout, "connect", self.connector.connect()).await
    }

    /// Store client, checked on every access and replaced when unhealthy
    async fn client(&self) -> Result<Arc<dyn CoordinationStore>> {
        if self.lifecycle().closed {
            return Err(Error::Closed);
        }

        {
            let current = self.client.read().await;
            if let Some(client) = current.as_ref() {
                match self.bounded("health check", client.health_check()).await {
                    Ok(()) => return Ok(Arc::clone(client)),
                    Err(e) => tracing::debug!(
                        node_id = self.id,
                        "Store client is unhealthy - creating new client: {}",
                        e
                    ),
                }
            }
        }

        let mut current = self.client.write().await;
        let client = self.connect().await?;
        *current = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Replace the store client unconditionally
    async fn refresh_client(&self) -> Result<()> {
        let mut current = self.client.write().await;
        *current = Some(self.connect().await?);
        Ok(())
    }

    async fn nodes(&self, client: &Arc<dyn CoordinationStore>) -> Result<Vec<NodeMetadata>> {
        let prefix = format_cluster_key(&self.cluster_name, NODES_PREFIX);
        let pairs = self.bounded("get_prefix", client.get_prefix(&prefix)).await?;

        pairs
            .iter()
            .map(|kv| NodeMetadata::from_json(kv.value.as_bytes()))
            .collect()
    }

    async fn cluster_values(
        &self,
        client: &Arc<dyn CoordinationStore>,
        key: &str,
    ) -> Result<HashMap<i64, Vec<KV>>> {
        let nodes = self.nodes(client).await?;
        let mut out: HashMap<i64, Vec<KV>> = nodes.iter().map(|n| (n.id, Vec::new())).collect();

        let prefix = format_cluster_key(&self.cluster_name, &state_data_prefix(key));
        let pairs = self.bounded("get_prefix", client.get_prefix(&prefix)).await?;

        for pair in pairs {
            let (node_id, base) = extract_node_id(&pair.key)?;
            out.entry(node_id).or_default().push(KV {
                key: base,
                value: pair.value,
            });
        }

        Ok(out)
    }

    fn spawn_campaigner(&self, token: CancellationToken, election: Arc<dyn Election>) {
        self.campaigns.spawn(campaign(self.id, token, election));
    }

    /// Reconnect loop: one lease and election session per iteration
    async fn state_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut retry = self.outer_backoff.start();

        while retry.wait(&shutdown).await {
            tracing::debug!(node_id = self.id, "Starting state loop");

            let client = match self.client().await {
                Ok(client) => client,
                Err(e) => {
                    self.log_failure("Failed to retrieve store client", &e);
                    continue;
                }
            };

            let granted = tokio::select! {
                _ = shutdown.cancelled() => break,
                granted = self.bounded("grant", client.grant(lease_ttl_secs(self.ttl))) => granted,
            };
            let lease = match granted {
                Ok(lease) => lease,
                Err(e) => {
                    self.log_failure("Failed to retrieve lease", &e);
                    continue;
                }
            };
            tracing::debug!(node_id = self.id, "Acquired lease {:x}", lease);
            self.state().lease = Some(lease);

            let session = match self.bounded("new_session", client.new_session(lease)).await {
                Ok(session) => session,
                Err(e) => {
                    self.log_failure("Failed to create session", &e);
                    self.cleanup_node().await;
                    continue;
                }
            };
            let lease = session.lease();
            tracing::debug!(node_id = self.id, "Opened election session on lease {:x}", lease);
            let election = session.election(&election_name(&self.cluster_name));
            {
                let mut state = self.state();
                state.session = Some(session);
                state.election = Some(Arc::clone(&election));
            }

            let session_token = shutdown.child_token();

            // only the same node restarting can find itself recorded as
            // leader; re-elect instead of assuming the role
            match self.bounded("leader", election.leader()).await {
                Ok(Some(leader)) if leader == self.id.to_string() => {
                    tracing::info!(
                        node_id = self.id,
                        "Node is already recorded as leader - resigning"
                    );
                    if let Err(e) = bounded(CLEANUP_TIMEOUT, "resign", election.resign()).await {
                        tracing::warn!(
                            node_id = self.id,
                            "Failed to resign stale leadership: {}",
                            e
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.log_failure("Failed to check for existing leader", &e);
                    self.cleanup_node().await;
                    session_token.cancel();
                    continue;
                }
            }

            retry.reset();
            self.operate(&client, lease, &election, &session_token, &shutdown)
                .await;
            session_token.cancel();
        }

        self.cleanup_node().await;
        tracing::debug!(node_id = self.id, "State loop exited");
    }

    /// Operating loop for one session. Always ends with a cleanup.
    async fn operate(
        self: &Arc<Self>,
        client: &Arc<dyn CoordinationStore>,
        lease: LeaseId,
        election: &Arc<dyn Election>,
        session: &CancellationToken,
        shutdown: &CancellationToken,
    ) {
        {
            let _transition = self.transition.lock().await;
            let generation = session.child_token();
            self.state().generation = Some(generation.clone());
            self.spawn_campaigner(generation, Arc::clone(election));
        }

        let mut retry = self.inner_backoff.start();
        while retry.wait(session).await {
            tracing::debug!(node_id = self.id, "Beginning campaign observation loop");

            let mut leaders = match self.bounded("observe", election.observe()).await {
                Ok(leaders) => leaders,
                Err(e) if e.is_retryable() => {
                    self.log_failure("Failed to observe election", &e);
                    continue;
                }
                Err(e) => {
                    // the session itself is gone, retrying cannot help
                    self.log_failure("Failed to observe election", &e);
                    session.cancel();
                    break;
                }
            };

            self.observe_loop(client, lease, &mut leaders, session).await;
            break;
        }

        tracing::debug!(
            node_id = self.id,
            "Cluster node is leaving its session - beginning cleanup"
        );
        self.cleanup_node().await;

        if !shutdown.is_cancelled() {
            if let Err(e) = self.refresh_client().await {
                tracing::error!(
                    node_id = self.id,
                    "Failed to create new client during cleanup: {}",
                    e
                );
            }
        }
        tracing::debug!(node_id = self.id, "Cleanup complete");
    }

    async fn observe_loop(
        self: &Arc<Self>,
        client: &Arc<dyn CoordinationStore>,
        lease: LeaseId,
        leaders: &mut LeaderStream,
        session: &CancellationToken,
    ) {
        let mut tick = self.tick();
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut lease_ticker =
            interval_at(Instant::now() + LEASE_RENEW_INTERVAL, LEASE_RENEW_INTERVAL);
        lease_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut loop_count: u64 = 0;
        let mut unknown_count: u32 = 0;
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            loop_count += 1;

            tokio::select! {
                biased;

                _ = session.cancelled() => break,

                _ = lease_ticker.tick() => {
                    match self.bounded("keep_alive_once", client.keep_alive_once(lease)).await {
                        Ok(()) => tracing::trace!(node_id = self.id, "Renewed lease"),
                        Err(e) => {
                            self.log_failure("Failed to renew lease", &e);
                            session.cancel();
                        }
                    }
                }

                _ = ticker.tick() => {
                    let role = self.state().role;
                    match role {
                        NodeRole::Unknown => {
                            if unknown_count > MAX_UNKNOWN_TICKS {
                                tracing::error!(
                                    node_id = self.id,
                                    "Node role is unknown for too long - aborting"
                                );
                                session.cancel();
                                continue;
                            }
                            if loop_count % UNKNOWN_LOG_EVERY == 0 {
                                tracing::debug!(
                                    node_id = self.id,
                                    "Node role is currently unknown"
                                );
                            }
                            unknown_count += 1;
                        }
                        role => {
                            unknown_count = 0;
                            in_flight = self.execute_routine(role, in_flight.take());
                        }
                    }
                }

                update = leaders.next() => {
                    let Some(Some(value)) = update else {
                        tracing::error!(
                            node_id = self.id,
                            "Cluster without leader for too long - aborting"
                        );
                        session.cancel();
                        continue;
                    };

                    let leader = match value.parse::<i64>() {
                        Ok(leader) => leader,
                        Err(_) => {
                            tracing::error!(node_id = self.id, "{}", Error::InvalidLeaderId(value));
                            session.cancel();
                            continue;
                        }
                    };

                    if let Err(e) = self.update_node_role(leader, session).await {
                        if e.forces_reelection() {
                            tracing::error!(node_id = self.id, "Forcing re-election: {}", e);
                        } else {
                            tracing::error!(node_id = self.id, "Failed to update node role: {}", e);
                        }
                        session.cancel();
                        continue;
                    }

                    let configured = self.tick();
                    if configured != tick {
                        tracing::info!(
                            node_id = self.id,
                            "Updating cluster tick from {:?} -> {:?}",
                            tick,
                            configured
                        );
                        tick = configured;
                        ticker = interval_at(Instant::now() + tick, tick);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
    }

    /// Launch the routine for `role` unless the previous one is still running
    fn execute_routine(
        self: &Arc<Self>,
        role: NodeRole,
        previous: Option<JoinHandle<()>>,
    ) -> Option<JoinHandle<()>> {
        if let Some(handle) = previous {
            if !handle.is_finished() {
                tracing::debug!(
                    node_id = self.id,
                    "{} routine still running - skipping tick",
                    role
                );
                return Some(handle);
            }
        }

        let token = self.state().generation.clone()?;
        let routines = Arc::clone(&self.routines);
        let node_id = self.id;

        Some(self.tasks.spawn(async move {
            let started = Instant::now();
            let result = match role {
                NodeRole::Leader => routines.lead(token).await,
                _ => routines.follow(token).await,
            };
            if let Err(e) = result {
                tracing::error!(node_id, "{} routine failed: {:#}", role, e);
            }
            tracing::trace!(node_id, "{} routine took {:?}", role, started.elapsed());
        }))
    }

    /// Move to the role implied by `leader`, publishing the change
    async fn update_node_role(
        self: &Arc<Self>,
        leader: i64,
        session: &CancellationToken,
    ) -> Result<()> {
        let _transition = self.transition.lock().await;
        let client = self.client().await?;

        let (current, election) = {
            let state = self.state();
            (state.role, state.election.clone())
        };

        if (leader == self.id && current == NodeRole::Leader)
            || (leader != self.id && current == NodeRole::Follower)
        {
            return Ok(());
        }

        let new_role = if leader == self.id {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        };
        tracing::info!(node_id = self.id, "Updating cluster role {} -> {}", current, new_role);

        let election = election.ok_or(Error::NotJoined)?;
        let generation = session.child_token();
        let previous = self.state().generation.replace(generation.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.spawn_campaigner(generation, election);

        self.validate_cluster_tick(&client).await?;

        let (meta, lease) = {
            let state = self.state();
            let start = if state.role == NodeRole::Unknown {
                Utc::now()
            } else {
                state.start
            };
            (
                NodeMetadata {
                    id: self.id,
                    address: self.address.clone(),
                    start,
                    role: new_role,
                },
                state.lease,
            )
        };
        let lease = lease.ok_or(Error::NoLease)?;

        // a node that reports a role always has a membership record
        let key = format_node_key(self.id, &self.cluster_name, NODES_PREFIX);
        self.bounded("put", client.put(&key, &meta.to_json()?, Some(lease)))
            .await?;

        {
            let mut state = self.state();
            state.start = meta.start;
            state.role = new_role;
        }

        tracing::info!(node_id = self.id, "Cluster node is now {}", new_role);
        Ok(())
    }

    /// Publish our tick and make sure every member uses the same one
    async fn validate_cluster_tick(&self, client: &Arc<dyn CoordinationStore>) -> Result<()> {
        let (tick, lease) = {
            let state = self.state();
            (state.tick.as_nanos(), state.lease)
        };
        let lease = lease.ok_or(Error::NoLease)?;
        let expected = tick.to_string();

        let key = self.state_key(self.id, TICK_KEY);
        self.bounded("put", client.put(&key, &expected, Some(lease)))
            .await?;

        let ticks = self.cluster_values(client, TICK_KEY).await?;
        for (node_id, values) in ticks {
            match values.first() {
                Some(kv) if kv.value == expected => {}
                other => {
                    return Err(Error::ClusterTickDisagreement {
                        local: tick,
                        node_id,
                        remote: other.map(|kv| kv.value.clone()),
                    })
                }
            }
        }

        Ok(())
    }

    /// Leave the current session: resign, revoke, forget. Safe to repeat.
    async fn cleanup_node(&self) {
        let _transition = self.transition.lock().await;

        // the local role goes first so nobody can observe a successor
        // while this node still reports itself as leader
        let (generation, was_leader, election, lease, session) = {
            let mut state = self.state();
            let was_leader = state.role == NodeRole::Leader;
            state.role = NodeRole::Unknown;
            (
                state.generation.take(),
                was_leader,
                state.election.take(),
                state.lease.take(),
                state.session.take(),
            )
        };

        if let Some(generation) = generation {
            generation.cancel();
        }
        self.campaigns.close();
        self.campaigns.wait().await;
        self.campaigns.reopen();

        if lease.is_none() && session.is_none() && !was_leader {
            return;
        }

        if was_leader {
            if let Some(election) = &election {
                if let Err(e) = bounded(CLEANUP_TIMEOUT, "resign", election.resign()).await {
                    tracing::error!(
                        node_id = self.id,
                        "Failed to resign as leader on cleanup: {}",
                        e
                    );
                }
            }
        }

        let client = match self.client().await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::error!(node_id = self.id, "Failed to get store client on cleanup: {}", e);
                None
            }
        };

        if let (Some(client), Some(lease)) = (&client, lease) {
            if let Err(e) = bounded(CLEANUP_TIMEOUT, "revoke", client.revoke(lease)).await {
                tracing::error!(node_id = self.id, "Failed to revoke lease on cleanup: {}", e);
            }
        }

        if let Some(session) = session {
            if let Err(e) = bounded(CLEANUP_TIMEOUT, "close_session", session.close()).await {
                tracing::warn!(node_id = self.id, "Failed to close session on cleanup: {}", e);
            }
        }

        if let Some(client) = &client {
            let key = format_node_key(self.id, &self.cluster_name, NODES_PREFIX);
            if let Err(e) = bounded(CLEANUP_TIMEOUT, "delete", client.delete(&key)).await {
                tracing::error!(
                    node_id = self.id,
                    "Failed to remove node from cluster state: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{RoutineFns, MIN_TICK};
    use crate::state::EventType;
    use crate::store::{MemoryStore, StoreError};
    use futures::stream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(10);

    struct Counters {
        leader: AtomicUsize,
        follower: AtomicUsize,
    }

    fn counting_routines() -> (Arc<Counters>, Arc<dyn NodeRoutines>) {
        let counters = Arc::new(Counters {
            leader: AtomicUsize::new(0),
            follower: AtomicUsize::new(0),
        });
        let lead = Arc::clone(&counters);
        let follow = Arc::clone(&counters);
        let routines = RoutineFns::new(
            move |_token| {
                lead.leader.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            move |_token| {
                follow.follower.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        );
        (counters, Arc::new(routines))
    }

    fn test_node(
        store: &MemoryStore,
        id: i64,
        cluster: &str,
        tick: Duration,
    ) -> (ClusterNode, Arc<Counters>) {
        test_node_with(Arc::new(store.clone()), id, cluster, tick)
    }

    fn test_node_with(
        connector: Arc<dyn StoreConnector>,
        id: i64,
        cluster: &str,
        tick: Duration,
    ) -> (ClusterNode, Arc<Counters>) {
        let (counters, routines) = counting_routines();
        let mut opts =
            ClusterNodeOptions::new(id, format!("node{}:7654", id), cluster, connector, routines);
        opts.ttl = Duration::from_secs(1);
        opts.tick = tick;
        opts.request_timeout = Duration::from_millis(500);
        opts.outer_backoff =
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(200));
        opts.inner_backoff =
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100));
        (ClusterNode::new(opts), counters)
    }

    /// Failure injected by [`FaultyConnector`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        None,
        /// leader feed never yields
        SilentFeed,
        /// leader feed yields a value that is not a node id
        GarbageLeader,
        /// leader feed yields an empty leader record
        EmptyRecord,
        /// leader feed ends right away
        ClosedFeed,
        /// every lease renewal is rejected
        RenewalFails,
    }

    /// Memory store connection with one injected failure. `partition`
    /// cuts the node off from the store entirely.
    #[derive(Clone)]
    struct FaultyConnector {
        store: MemoryStore,
        fault: Fault,
        grants: Arc<AtomicUsize>,
        partitioned: Arc<AtomicBool>,
    }

    impl FaultyConnector {
        fn new(store: &MemoryStore, fault: Fault) -> Self {
            Self {
                store: store.clone(),
                fault,
                grants: Arc::new(AtomicUsize::new(0)),
                partitioned: Arc::new(AtomicBool::new(false)),
            }
        }

        fn grants(&self) -> usize {
            self.grants.load(Ordering::SeqCst)
        }

        fn partition(&self) {
            self.partitioned.store(true, Ordering::SeqCst);
        }

        fn check(&self) -> StoreResult<()> {
            if self.partitioned.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StoreConnector for FaultyConnector {
        async fn connect(&self) -> StoreResult<Arc<dyn CoordinationStore>> {
            Ok(Arc::new(FaultyClient {
                inner: self.store.connect().await?,
                conn: self.clone(),
            }))
        }
    }

    struct FaultyClient {
        inner: Arc<dyn CoordinationStore>,
        conn: FaultyConnector,
    }

    #[async_trait]
    impl CoordinationStore for FaultyClient {
        async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
            self.conn.check()?;
            self.conn.grants.fetch_add(1, Ordering::SeqCst);
            self.inner.grant(ttl_secs).await
        }

        async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<()> {
            self.conn.check()?;
            if self.conn.fault == Fault::RenewalFails {
                return Err(StoreError::Backend("renewal rejected".to_string()));
            }
            self.inner.keep_alive_once(lease).await
        }

        async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.revoke(lease).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<crate::store::KeyValue>> {
            self.conn.check()?;
            self.inner.get(key).await
        }

        async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<crate::store::KeyValue>> {
            self.conn.check()?;
            self.inner.get_prefix(prefix).await
        }

        async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.put(key, value, lease).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.delete(key).await
        }

        async fn watch_prefix(&self, prefix: &str) -> StoreResult<crate::store::WatchStream> {
            self.conn.check()?;
            self.inner.watch_prefix(prefix).await
        }

        async fn new_session(&self, lease: LeaseId) -> StoreResult<Arc<dyn Session>> {
            self.conn.check()?;
            Ok(Arc::new(FaultySession {
                inner: self.inner.new_session(lease).await?,
                conn: self.conn.clone(),
            }))
        }

        async fn health_check(&self) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.health_check().await
        }

        async fn close(&self) -> StoreResult<()> {
            self.inner.close().await
        }
    }

    struct FaultySession {
        inner: Arc<dyn Session>,
        conn: FaultyConnector,
    }

    #[async_trait]
    impl Session for FaultySession {
        fn lease(&self) -> LeaseId {
            self.inner.lease()
        }

        fn election(&self, name: &str) -> Arc<dyn Election> {
            Arc::new(FaultyElection {
                inner: self.inner.election(name),
                conn: self.conn.clone(),
            })
        }

        async fn close(&self) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.close().await
        }
    }

    struct FaultyElection {
        inner: Arc<dyn Election>,
        conn: FaultyConnector,
    }

    #[async_trait]
    impl Election for FaultyElection {
        async fn campaign(&self, value: &str) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.campaign(value).await
        }

        async fn observe(&self) -> StoreResult<LeaderStream> {
            self.conn.check()?;
            match self.conn.fault {
                Fault::SilentFeed => Ok(stream::pending::<Option<String>>().boxed()),
                Fault::GarbageLeader => Ok(stream::iter([Some("abc".to_string())])
                    .chain(stream::pending())
                    .boxed()),
                Fault::EmptyRecord => Ok(stream::iter([None::<String>])
                    .chain(stream::pending())
                    .boxed()),
                Fault::ClosedFeed => Ok(stream::empty::<Option<String>>().boxed()),
                Fault::None | Fault::RenewalFails => self.inner.observe().await,
            }
        }

        async fn resign(&self) -> StoreResult<()> {
            self.conn.check()?;
            self.inner.resign().await
        }

        async fn leader(&self) -> StoreResult<Option<String>> {
            self.conn.check()?;
            self.inner.leader().await
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    fn leaders(nodes: &[&ClusterNode]) -> usize {
        nodes.iter().filter(|n| n.role() == NodeRole::Leader).count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_node_becomes_leader() {
        let store = MemoryStore::new();
        let (node, counters) = test_node(&store, 1, "single", Duration::from_millis(50));

        assert!(matches!(node.get_leader().await, Err(Error::NotJoined)));

        node.start();
        node.start();
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);
        assert_eq!(node.get_leader().await.unwrap(), Some(1));

        let meta = node.get_self_metadata();
        assert_eq!(meta.role, NodeRole::Leader);
        assert!(meta.start > DateTime::<Utc>::UNIX_EPOCH);

        let stored = node.get_node_metadata(1).await.unwrap().unwrap();
        assert_eq!(stored.role, NodeRole::Leader);
        assert_eq!(stored.address, "node1:7654");

        assert!(wait_until(|| counters.leader.load(Ordering::SeqCst) >= 3).await);
        assert_eq!(counters.follower.load(Ordering::SeqCst), 0);

        node.stop().await;
        assert_eq!(node.role(), NodeRole::Unknown);
        assert!(!node.is_started());
        assert!(node.get_node_metadata(1).await.unwrap().is_none());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_nodes_agree_on_one_leader() {
        let store = MemoryStore::new();
        let tick = Duration::from_millis(50);
        let (node1, c1) = test_node(&store, 11, "trio", tick);
        let (node2, c2) = test_node(&store, 12, "trio", tick);
        let (node3, c3) = test_node(&store, 13, "trio", tick);

        node1.start();
        node2.start();
        node3.start();

        let all = [&node1, &node2, &node3];
        assert!(wait_until(|| all.iter().all(|n| n.role() != NodeRole::Unknown)).await);

        // sample roles for a while, never more than one leader
        for _ in 0..50 {
            assert!(leaders(&all) <= 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(leaders(&all), 1);

        let leader = all.iter().find(|n| n.role() == NodeRole::Leader).unwrap();
        for node in all {
            assert_eq!(node.get_leader().await.unwrap(), Some(leader.id()));
        }

        let mut ids: Vec<i64> = node2.get_nodes().await.unwrap().iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec![11, 12, 13]);

        let follower_runs = || {
            [&c1, &c2, &c3]
                .iter()
                .map(|c| c.follower.load(Ordering::SeqCst))
                .sum::<usize>()
        };
        let leader_runs = || {
            [&c1, &c2, &c3]
                .iter()
                .map(|c| c.leader.load(Ordering::SeqCst))
                .sum::<usize>()
        };
        assert!(wait_until(|| follower_runs() >= 6 && leader_runs() >= 3).await);

        for node in all {
            node.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_graceful_leader_handoff() {
        let store = MemoryStore::new();
        let tick = Duration::from_millis(50);
        let (node1, _) = test_node(&store, 21, "handoff", tick);
        let (node2, _) = test_node(&store, 22, "handoff", tick);

        node1.start();
        assert!(wait_until(|| node1.role() == NodeRole::Leader).await);
        node2.start();
        assert!(wait_until(|| node2.role() == NodeRole::Follower).await);

        node1.stop().await;
        assert_eq!(node1.role(), NodeRole::Unknown);

        assert!(wait_until(|| node2.role() == NodeRole::Leader).await);
        assert_eq!(node2.get_leader().await.unwrap(), Some(22));

        let ids: Vec<i64> = node2.get_nodes().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![22]);

        // the stopped node can rejoin and follows the new leader
        node1.start();
        assert!(wait_until(|| node1.role() == NodeRole::Follower).await);

        node1.stop().await;
        node2.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tick_disagreement_keeps_node_unknown() {
        let store = MemoryStore::new();
        let (node1, _) = test_node(&store, 31, "ticks", Duration::from_millis(50));
        let (node2, c2) = test_node(&store, 32, "ticks", Duration::from_millis(80));

        node1.start();
        assert!(wait_until(|| node1.role() == NodeRole::Leader).await);

        node2.start();
        for _ in 0..150 {
            assert_ne!(node2.role(), NodeRole::Leader);
            assert_ne!(node2.role(), NodeRole::Follower);
            assert_eq!(node1.role(), NodeRole::Leader);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c2.follower.load(Ordering::SeqCst), 0);

        let ids: Vec<i64> = node1.get_nodes().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![31]);

        node2.stop().await;
        node1.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_put_get_and_cluster() {
        let store = MemoryStore::new();
        let tick = Duration::from_millis(50);
        let (node1, _) = test_node(&store, 41, "state", tick);
        let (node2, _) = test_node(&store, 42, "state", tick);
        let (node3, _) = test_node(&store, 43, "state", tick);

        assert!(matches!(node1.put("addr", "x").await, Err(Error::NoLease)));

        for node in [&node1, &node2, &node3] {
            node.start();
        }
        let nodes = [&node1, &node2, &node3];
        assert!(wait_until(|| nodes.iter().all(|n| n.role() != NodeRole::Unknown)).await);

        node1.put("addr", "10.0.0.41").await.unwrap();
        node2.put("addr", "10.0.0.42").await.unwrap();

        assert_eq!(node1.get("addr").await.unwrap(), Some("10.0.0.41".to_string()));
        assert_eq!(node3.get("addr").await.unwrap(), None);
        assert_eq!(node3.get_as_node(42, "addr").await.unwrap(), Some("10.0.0.42".to_string()));

        let cluster = node3.get_cluster("addr").await.unwrap();
        assert_eq!(cluster.len(), 3);
        assert_eq!(
            cluster[&41],
            vec![KV {
                key: "/state/state-data/addr".to_string(),
                value: "10.0.0.41".to_string(),
            }]
        );
        assert_eq!(cluster[&42].len(), 1);
        assert!(cluster[&43].is_empty());

        node1.delete("addr").await.unwrap();
        node1.delete("addr").await.unwrap();
        assert_eq!(node1.get("addr").await.unwrap(), None);

        for node in [&node1, &node2, &node3] {
            node.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_watch_key_cluster_classifies_events() {
        let store = MemoryStore::new();
        let (node1, _) = test_node(&store, 51, "watch", Duration::from_millis(50));
        let (node2, _) = test_node(&store, 52, "watch", Duration::from_millis(50));
        node1.start();
        node2.start();
        let joined = || node1.role() != NodeRole::Unknown && node2.role() != NodeRole::Unknown;
        assert!(wait_until(joined).await);

        let token = CancellationToken::new();
        let mut events = node1.watch_key_cluster(token.clone(), "status").await.unwrap();

        node2.put("status", "booting").await.unwrap();
        node2.put("status", "ready").await.unwrap();
        node2.delete("status").await.unwrap();

        let added = events.recv().await.unwrap();
        assert_eq!(added.event_type, EventType::Added);
        assert_eq!(added.node_id, 52);
        assert_eq!(added.key, "/watch/state-data/status/52");
        assert_eq!(added.value, "booting");
        assert!(added.old_key.is_empty() && added.old_value.is_empty());

        let modified = events.recv().await.unwrap();
        assert_eq!(modified.event_type, EventType::Modified);
        assert_eq!(modified.node_id, 52);
        assert_eq!(modified.value, "ready");
        assert_eq!(modified.old_value, "booting");

        let deleted = events.recv().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Deleted);
        assert_eq!(deleted.node_id, 52);
        assert!(deleted.key.is_empty() && deleted.value.is_empty());
        assert_eq!(deleted.old_key, "/watch/state-data/status/52");
        assert_eq!(deleted.old_value, "ready");

        token.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        assert!(closed.unwrap().is_none());

        node1.stop().await;
        node2.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_closes_watch() {
        let store = MemoryStore::new();
        let (node, _) = test_node(&store, 55, "watch-stop", Duration::from_millis(50));
        node.start();

        let mut events = node.watch_key_cluster(CancellationToken::new(), "k").await.unwrap();
        node.stop().await;
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recovers_from_store_outage() {
        let store = MemoryStore::new();
        let (node, _) = test_node(&store, 61, "outage", Duration::from_millis(50));

        node.start();
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);

        store.set_available(false);
        assert!(wait_until(|| node.role() == NodeRole::Unknown).await);
        for _ in 0..20 {
            assert_eq!(node.role(), NodeRole::Unknown);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        store.set_available(true);
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);

        node.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_is_final() {
        let store = MemoryStore::new();
        let (node, _) = test_node(&store, 71, "close", Duration::from_millis(50));

        node.start();
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);

        node.close().await.unwrap();
        assert_eq!(node.role(), NodeRole::Unknown);

        node.start();
        assert!(!node.is_started());
        assert!(matches!(node.get("anything").await, Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_routine_does_not_block_lease() {
        let store = MemoryStore::new();
        let routines = RoutineFns::new(
            |token: CancellationToken| async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                }
                Ok(())
            },
            |_token| async { Ok(()) },
        );
        let mut opts = ClusterNodeOptions::new(
            81,
            "node81:7654",
            "slow",
            Arc::new(store.clone()),
            Arc::new(routines),
        );
        opts.ttl = Duration::from_secs(1);
        let node = ClusterNode::new(opts);

        node.start();
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);

        // well past the lease TTL while the routine is still busy
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(node.role(), NodeRole::Leader);
        assert!(node.get_node_metadata(81).await.unwrap().is_some());

        node.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tick_reconfiguration_is_published() {
        let store = MemoryStore::new();
        let (node, _) = test_node(&store, 91, "retick", Duration::from_millis(50));
        node.start();
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);
        assert_eq!(node.get(TICK_KEY).await.unwrap(), Some("50000000".to_string()));

        node.set_tick(Duration::from_millis(100));
        node.stop().await;
        node.start();
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);
        assert_eq!(node.get(TICK_KEY).await.unwrap(), Some("100000000".to_string()));

        node.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_zero_tick_keeps_single_leader() {
        let store = MemoryStore::new();
        let tick = Duration::from_millis(50);
        let (node1, _) = test_node(&store, 111, "zero-tick", tick);
        let (node2, c2) = test_node(&store, 112, "zero-tick", tick);

        node1.start();
        assert!(wait_until(|| node1.role() == NodeRole::Leader).await);
        node2.start();
        assert!(wait_until(|| node2.role() == NodeRole::Follower).await);

        node2.set_tick(Duration::ZERO);
        assert_eq!(node2.tick(), MIN_TICK);

        node1.stop().await;
        assert!(wait_until(|| node2.role() == NodeRole::Leader).await);
        assert_eq!(
            node2.get(TICK_KEY).await.unwrap(),
            Some(MIN_TICK.as_nanos().to_string())
        );

        // the state loop survives the new ticker and keeps running routines
        let runs = c2.leader.load(Ordering::SeqCst);
        assert!(wait_until(|| c2.leader.load(Ordering::SeqCst) > runs + 10).await);

        // well past the lease TTL, so a dead loop would have lost the lease
        tokio::time::sleep(Duration::from_millis(1500)).await;
        node1.start();
        for _ in 0..100 {
            assert!(leaders(&[&node1, &node2]) <= 1);
            assert_eq!(node2.role(), NodeRole::Leader);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node2.get_leader().await.unwrap(), Some(112));

        node1.stop().await;
        node2.stop().await;
    }

    #[tokio::test]
    async fn test_zero_tick_option_is_raised() {
        let store = MemoryStore::new();
        let (node, _) = test_node(&store, 113, "zero-opt", Duration::ZERO);
        assert_eq!(node.tick(), MIN_TICK);
    }

    /// Start a node behind `fault` and wait until it has opened three sessions
    async fn assert_session_recycled(fault: Fault, cluster: &str) {
        let store = MemoryStore::new();
        let faulty = FaultyConnector::new(&store, fault);
        let (node, counters) =
            test_node_with(Arc::new(faulty.clone()), 201, cluster, Duration::from_millis(10));

        node.start();
        let recycled = wait_until(|| {
            assert_eq!(node.role(), NodeRole::Unknown, "{:?}", fault);
            faulty.grants() >= 3
        })
        .await;
        assert!(recycled, "{:?}: session was not recycled", fault);

        assert_eq!(counters.leader.load(Ordering::SeqCst), 0);
        assert_eq!(counters.follower.load(Ordering::SeqCst), 0);
        assert!(node.get_nodes().await.unwrap().is_empty());

        node.stop().await;
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_leader_feed_aborts_unknown_role() {
        assert_session_recycled(Fault::SilentFeed, "silent-feed").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unparsable_leader_id_recycles_session() {
        assert_session_recycled(Fault::GarbageLeader, "garbage-leader").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_empty_leader_record_recycles_session() {
        assert_session_recycled(Fault::EmptyRecord, "empty-record").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_closed_leader_feed_recycles_session() {
        assert_session_recycled(Fault::ClosedFeed, "closed-feed").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_renewal_failure_recycles_session() {
        let store = MemoryStore::new();
        let faulty = FaultyConnector::new(&store, Fault::RenewalFails);
        let (node, _) =
            test_node_with(Arc::new(faulty.clone()), 202, "renewal", Duration::from_millis(50));

        node.start();
        // the leader feed is healthy, so the node does resolve its role
        assert!(wait_until(|| node.role() == NodeRole::Leader).await);
        assert!(wait_until(|| faulty.grants() >= 3).await);

        node.stop().await;
        assert_eq!(node.role(), NodeRole::Unknown);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cut_off_node_keys_expire_with_lease() {
        let store = MemoryStore::new();
        let tick = Duration::from_millis(50);
        let faulty = FaultyConnector::new(&store, Fault::None);
        let (lost, _) = test_node_with(Arc::new(faulty.clone()), 301, "cut-off", tick);
        let (survivor, _) = test_node(&store, 302, "cut-off", tick);

        lost.start();
        assert!(wait_until(|| lost.role() == NodeRole::Leader).await);
        lost.put("addr", "10.0.0.31").await.unwrap();
        survivor.start();
        assert!(wait_until(|| survivor.role() == NodeRole::Follower).await);

        // from here on the lost node can neither renew nor clean up
        faulty.partition();
        let took_over = wait_until(|| {
            assert!(leaders(&[&lost, &survivor]) <= 1);
            survivor.role() == NodeRole::Leader
        })
        .await;
        assert!(took_over);

        let client = store.client();
        let membership = format_node_key(301, "cut-off", NODES_PREFIX);
        assert!(client.get(&membership).await.unwrap().is_none());
        assert_eq!(survivor.get_as_node(301, "addr").await.unwrap(), None);

        let ids: Vec<i64> = survivor.get_nodes().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![302]);
        assert!(wait_until(|| lost.role() == NodeRole::Unknown).await);

        lost.stop().await;
        survivor.stop().await;
    }

    #[test]
    fn test_lease_ttl_secs() {
        assert_eq!(lease_ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(lease_ttl_secs(Duration::from_millis(2999)), 2);
        assert_eq!(lease_ttl_secs(Duration::from_secs(10)), 10);
    }
}
