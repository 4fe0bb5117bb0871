//! Shared snapshot cache for rowgraph sessions.
//!
//! A [`SnapshotStore`] maps [`ObjectId`](rowgraph_core::ObjectId)s to the last
//! committed [`DataRow`](rowgraph_core::DataRow) of each object. Several
//! sessions may share one store; changes applied through
//! [`SnapshotStore::process_changes`] are broadcast to every subscriber except
//! the one that posted them.

pub mod config;
pub mod event;
pub mod snapshot_store;

pub use config::SnapshotStoreConfig;
pub use event::{SnapshotChanges, SnapshotEvent, SnapshotListener, SubscriberId};
pub use snapshot_store::{CacheStats, SnapshotStore};
