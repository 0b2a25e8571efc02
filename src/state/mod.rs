//! State Module
//!
//! Types describing a node's role, its published membership record and
//! the change notifications surfaced from cluster-wide watches.

mod events;
mod membership;

pub use events::{EventType, StateChangeEvent, KV};
pub use membership::{NodeMetadata, NodeRole};
