//! State Change Events
//!
//! Normalized notifications built from the store's raw watch feed.

use crate::error::Result;
use crate::keys::extract_node_id;
use crate::store::{WatchEvent, WatchEventKind};

/// Type of change that happened to a state key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Value was written and previously did not exist
    Added,
    /// Value was written and previously existed
    Modified,
    /// Value was removed
    Deleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Added => write!(f, "Added"),
            EventType::Modified => write!(f, "Modified"),
            EventType::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A change to a node-scoped state key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub event_type: EventType,
    pub node_id: i64,
    pub key: String,
    pub value: String,
    pub old_key: String,
    pub old_value: String,
}

impl StateChangeEvent {
    /// Classify a raw watch event.
    ///
    /// Puts without a previous value are `Added`, puts with one are
    /// `Modified`, everything else is `Deleted`. The owning node id comes
    /// from whichever key is present, preferring the current one.
    pub fn from_watch(event: &WatchEvent) -> Result<Self> {
        let event_type = match event.kind {
            WatchEventKind::Put if event.prev_kv.is_none() => EventType::Added,
            WatchEventKind::Put => EventType::Modified,
            WatchEventKind::Delete => EventType::Deleted,
        };

        let key = event
            .kv
            .as_ref()
            .or(event.prev_kv.as_ref())
            .map(|kv| kv.key.as_str())
            .unwrap_or_default();
        let (node_id, _) = extract_node_id(key)?;

        let mut out = StateChangeEvent {
            event_type,
            node_id,
            key: String::new(),
            value: String::new(),
            old_key: String::new(),
            old_value: String::new(),
        };

        if event_type != EventType::Added {
            if let Some(prev) = &event.prev_kv {
                out.old_key = prev.key.clone();
                out.old_value = prev.value.clone();
            }
        }
        if event_type != EventType::Deleted {
            if let Some(kv) = &event.kv {
                out.key = kv.key.clone();
                out.value = kv.value.clone();
            }
        }

        Ok(out)
    }
}

/// Simple key-value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KV {
    pub key: String,
    pub value: String,
}
