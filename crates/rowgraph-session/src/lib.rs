//! Object graph sessions for rowgraph.
//!
//! `rowgraph-session` is the **object layer**. A [`DataContext`] keeps one
//! in-memory object per row identity, turns relationships into lazily
//! resolved faults, records every change, and writes the accumulated changes
//! back in a single transaction.
//!
//! # Role In The Architecture
//!
//! - **Object store**: one [`PersistentObject`] per [`ObjectId`] per context.
//! - **Faults**: HOLLOW objects and unresolved relationships are fetched on
//!   first access.
//! - **Change tracking**: attribute and relationship edits become
//!   [`GraphDiff`]s; reverse relationships are kept consistent.
//! - **Commit**: pending changes are ordered into DML batches and executed
//!   with optimistic locking.
//! - **Synchronization**: committed changes flow through the shared
//!   [`SnapshotStore`] to every other context of the same [`DataDomain`].
//! - **Nesting**: a child context reads through its parent and commits
//!   into it.
//! - **Callbacks**: [`LifecycleCallbacks`] observe objects being added,
//!   loaded, persisted, updated and removed.
//!
//! # Design Philosophy
//!
//! - **Explicit commit**: nothing is written until `commit_changes`.
//! - **Shared rows, private objects**: contexts share immutable snapshots,
//!   never objects.
//! - **Synchronous**: executors block; callers pick their own threads.
//!
//! # Example
//!
//! ```ignore
//! let context = domain.create_context();
//!
//! let artists = context.select(
//!     &ObjectSelect::query("Artist")
//!         .filter(Qualifier::eq("ARTIST_NAME", "Monet"))
//!         .prefetch("paintings", PrefetchSemantics::Disjoint),
//! )?;
//!
//! let painting = context.new_object("Painting")?;
//! painting.write_property("title", "Water Lilies")?;
//! painting.set_to_one("artist", Some(&artists[0]))?;
//!
//! context.commit_changes()?;
//! ```
//!
//! [`ObjectId`]: rowgraph_core::ObjectId
//! [`SnapshotStore`]: rowgraph_cache::SnapshotStore

mod commit;
mod config;
mod context;
mod diff;
mod domain;
mod events;
mod fault;
mod lifecycle;
mod nested;
mod object;
mod object_store;
mod paginated;
mod prefetch;
mod query;
mod query_cache;
mod sync;
mod tracking;

#[cfg(test)]
mod testing;

pub use config::ContextConfig;
pub use context::DataContext;
pub use diff::GraphDiff;
pub use domain::DataDomain;
pub use events::ContextEvent;
pub use lifecycle::{LifecycleCallbacks, LifecycleEvent};
pub use object::{ObjectRef, PersistenceState, PersistentObject, ToManySlot, ToOneSlot};
pub use object_store::ObjectStore;
pub use paginated::PaginatedList;
pub use prefetch::{PrefetchSemantics, PrefetchTreeNode};
pub use query::{ObjectSelect, QueryResult};
pub use query_cache::QueryCacheStrategy;
