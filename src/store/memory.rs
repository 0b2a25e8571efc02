//! In-Memory Coordination Store
//!
//! A single-process store with the same lease, election and watch
//! semantics the engine relies on. Leases expire lazily on every
//! operation and from a background reaper, so the keys of a node that
//! stops renewing disappear without anyone else touching the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use super::{
    CoordinationStore, Election, KeyValue, LeaderStream, LeaseId, Session, StoreConnector,
    StoreError, StoreResult, WatchEvent, WatchEventKind, WatchStream,
};

/// How often the reaper expires leases
const REAPER_INTERVAL: Duration = Duration::from_millis(50);

/// Buffered change batches per watcher before it starts losing events
const WATCH_BUFFER: usize = 1024;

/// First lease id handed out
const FIRST_LEASE_ID: LeaseId = 0x1000;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
    create_revision: u64,
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

struct StoreState {
    revision: u64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseEntry>,
    available: bool,
}

impl StoreState {
    fn new() -> Self {
        Self {
            revision: 0,
            next_lease: FIRST_LEASE_ID,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            available: true,
        }
    }

    fn put(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<WatchEvent> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        self.revision += 1;
        let create_revision = self
            .kvs
            .get(key)
            .map(|e| e.create_revision)
            .unwrap_or(self.revision);

        let prev = self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
                create_revision,
            },
        );

        Ok(WatchEvent {
            kind: WatchEventKind::Put,
            kv: Some(KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
            prev_kv: prev.map(|e| KeyValue {
                key: key.to_string(),
                value: e.value,
            }),
        })
    }

    fn delete(&mut self, key: &str) -> Option<WatchEvent> {
        let prev = self.kvs.remove(key)?;
        self.revision += 1;
        Some(WatchEvent {
            kind: WatchEventKind::Delete,
            kv: None,
            prev_kv: Some(KeyValue {
                key: key.to_string(),
                value: prev.value,
            }),
        })
    }

    fn remove_lease(&mut self, lease: LeaseId) -> Option<Vec<WatchEvent>> {
        self.leases.remove(&lease)?;

        let attached: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();

        Some(attached.iter().filter_map(|k| self.delete(k)).collect())
    }

    fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::new();
        for id in expired {
            tracing::debug!("Lease {:x} expired", id);
            events.extend(self.remove_lease(id).unwrap_or_default());
        }
        events
    }

    fn range<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Candidate with the lowest creation revision under `prefix`
    fn leader<'a>(&'a self, prefix: &'a str) -> Option<(&'a String, &'a Entry)> {
        self.range(prefix).min_by_key(|(_, e)| e.create_revision)
    }
}

struct Shared {
    state: Mutex<StoreState>,
    events: broadcast::Sender<Vec<WatchEvent>>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &StoreState, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let _ = self.events.send(events);
        self.revision.send_replace(state.revision);
    }

    /// Run `f` against the store state after expiring leases
    fn with<T>(
        &self,
        f: impl FnOnce(&mut StoreState, &mut Vec<WatchEvent>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut state = self.lock();
        if !state.available {
            return Err(StoreError::Unavailable);
        }

        let mut events = state.expire(Instant::now());
        let out = f(&mut state, &mut events);
        self.publish(&state, events);
        out
    }

    fn reap(&self) {
        let mut state = self.lock();
        let events = state.expire(Instant::now());
        self.publish(&state, events);
    }
}

/// In-process coordination store
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store. Inside a tokio runtime a reaper task
    /// expires leases in the background until the store is dropped.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState::new()),
            events,
            revision,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reaper(Arc::downgrade(&shared)));
        }

        Self { shared }
    }

    /// Open a client connection
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
        self.shared.revision.send_modify(|_| {});
        tracing::info!(
            "Memory store is now {}",
            if available { "available" } else { "unavailable" }
        );
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.shared.lock().leases.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reaper(shared: Weak<Shared>) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    loop {
        interval.tick().await;
        match shared.upgrade() {
            Some(shared) => shared.reap(),
            None => break,
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> StoreResult<Arc<dyn CoordinationStore>> {
        Ok(Arc::new(self.client()))
    }
}

/// Client connection to a [`MemoryStore`]
pub struct MemoryClient {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryClient {
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        self.check()?;
        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        self.shared.with(|state, _| {
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + ttl,
                },
            );
            Ok(id)
        })
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<()> {
        self.check()?;
        self.shared.with(|state, _| {
            let entry = state
                .leases
                .get_mut(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            entry.deadline = Instant::now() + entry.ttl;
            Ok(())
        })
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.check()?;
        self.shared.with(|state, events| {
            let removed = state
                .remove_lease(lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            events.extend(removed);
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.check()?;
        self.shared.with(|state, _| {
            Ok(state.kvs.get(key).map(|e| KeyValue {
                key: key.to_string(),
                value: e.value.clone(),
            }))
        })
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.check()?;
        self.shared.with(|state, _| {
            Ok(state
                .range(prefix)
                .map(|(k, e)| KeyValue {
                    key: k.clone(),
                    value: e.value.clone(),
                })
                .collect())
        })
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        self.check()?;
        self.shared.with(|state, events| {
            events.push(state.put(key, value, lease)?);
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.shared.with(|state, events| {
            events.extend(state.delete(key));
            Ok(())
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        self.check()?;
        self.shared.with(|_, _| Ok(()))?;

        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.shared.events.subscribe()).filter_map(move |batch| {
            let matching = match batch {
                Ok(batch) => batch
                    .into_iter()
                    .filter(|e| watch_key(e).starts_with(&prefix))
                    .collect::<Vec<_>>(),
                Err(e) => {
                    tracing::warn!("Watch on {} fell behind: {}", prefix, e);
                    Vec::new()
                }
            };
            futures::future::ready((!matching.is_empty()).then_some(matching))
        });

        Ok(stream.boxed())
    }

    async fn new_session(&self, lease: LeaseId) -> StoreResult<Arc<dyn Session>> {
        self.check()?;
        self.shared.with(|state, _| {
            if state.leases.contains_key(&lease) {
                Ok(())
            } else {
                Err(StoreError::LeaseNotFound(lease))
            }
        })?;

        Ok(Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            lease,
            closed: AtomicBool::new(false),
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.check()?;
        self.shared.with(|_, _| Ok(()))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn watch_key(event: &WatchEvent) -> &str {
    event
        .kv
        .as_ref()
        .or(event.prev_kv.as_ref())
        .map(|kv| kv.key.as_str())
        .unwrap_or_default()
}

struct MemorySession {
    shared: Arc<Shared>,
    lease: LeaseId,
    closed: AtomicBool,
}

#[async_trait]
impl Session for MemorySession {
    fn lease(&self) -> LeaseId {
        self.lease
    }

    fn election(&self, name: &str) -> Arc<dyn Election> {
        let prefix = format!("{}/", name);
        Arc::new(MemoryElection {
            shared: Arc::clone(&self.shared),
            lease: self.lease,
            key: format!("{}{:x}", prefix, self.lease),
            prefix,
        })
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // the lease may already be revoked or expired
        self.shared.with(|state, events| {
            events.extend(state.remove_lease(self.lease).unwrap_or_default());
            Ok(())
        })
    }
}

struct MemoryElection {
    shared: Arc<Shared>,
    lease: LeaseId,
    prefix: String,
    key: String,
}

impl MemoryElection {
    fn is_leader(&self) -> StoreResult<bool> {
        self.shared.with(|state, _| {
            if !state.leases.contains_key(&self.lease) {
                return Err(StoreError::SessionClosed);
            }
            Ok(state.leader(&self.prefix).map(|(k, _)| k == &self.key).unwrap_or(false))
        })
    }
}

#[async_trait]
impl Election for MemoryElection {
    async fn campaign(&self, value: &str) -> StoreResult<()> {
        let mut changes = self.shared.revision.subscribe();

        self.shared.with(|state, events| {
            if state.kvs.get(&self.key).map(|e| e.value.as_str()) != Some(value) {
                events.push(state.put(&self.key, value, Some(self.lease))?);
            }
            Ok(())
        })?;

        loop {
            if self.is_leader()? {
                return Ok(());
            }
            changes.changed().await.map_err(|_| StoreError::Closed)?;
        }
    }

    async fn observe(&self) -> StoreResult<LeaderStream> {
        // fail fast when the session is already gone
        self.is_leader()?;

        let changes = self.shared.revision.subscribe();
        let shared = Arc::clone(&self.shared);
        let prefix = self.prefix.clone();
        let lease = self.lease;

        let stream = futures::stream::unfold(
            (changes, None::<String>),
            move |(mut changes, last)| {
                let shared = Arc::clone(&shared);
                let prefix = prefix.clone();
                async move {
                    loop {
                        let current = {
                            let state = shared.lock();
                            if !state.available || !state.leases.contains_key(&lease) {
                                return None;
                            }
                            state.leader(&prefix).map(|(_, e)| e.value.clone())
                        };

                        if let Some(leader) = current {
                            if last.as_ref() != Some(&leader) {
                                return Some((Some(leader.clone()), (changes, Some(leader))));
                            }
                        }

                        if changes.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn resign(&self) -> StoreResult<()> {
        self.shared.with(|state, events| {
            events.extend(state.delete(&self.key));
            Ok(())
        })
    }

    async fn leader(&self) -> StoreResult<Option<String>> {
        self.shared
            .with(|state, _| Ok(state.leader(&self.prefix).map(|(_, e)| e.value.clone())))
    }
}
