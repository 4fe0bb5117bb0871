//! rowgraph - an object graph cache and synchronization engine over
//! relational rows.
//!
//! rowgraph maps rows to objects and keeps them consistent:
//!
//! - One object per row identity in each [`DataContext`]
//! - Lazily resolved relationships (faults) and HOLLOW objects
//! - Change tracking with reverse relationship maintenance
//! - Ordered, batched commits with optimistic locking
//! - A shared snapshot cache that propagates commits to every context
//! - Joint, disjoint and disjoint-by-id prefetching
//!
//! # Quick Start
//!
//! ```ignore
//! use rowgraph::prelude::*;
//!
//! let resolver = EntityResolver::new(vec![
//!     EntityInfo::new("Artist", "ARTIST")
//!         .pk("ARTIST_ID")
//!         .lock_attribute("name", "ARTIST_NAME")
//!         .optimistic_locking()
//!         .relationship(RelationshipInfo::one_to_many("paintings", "Painting").join("ARTIST_ID", "ARTIST_ID")),
//!     EntityInfo::new("Painting", "PAINTING")
//!         .pk("PAINTING_ID")
//!         .attribute("title", "PAINTING_TITLE")
//!         .relationship(RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ARTIST_ID")),
//! ])?;
//!
//! let db = Arc::new(MemoryDatabase::new());
//! let domain = DataDomain::new(resolver, db, Arc::new(SequencePkGenerator::new()));
//!
//! let context = domain.create_context();
//! let artist = context.new_object("Artist")?;
//! artist.write_property("name", "Monet")?;
//! context.commit_changes()?;
//!
//! let other = domain.create_context();
//! let artists = other.select(&ObjectSelect::query("Artist").prefetch("paintings", PrefetchSemantics::Joint))?;
//! ```
//!
//! # Crates
//!
//! - `rowgraph-core`: values, rows, ids, metadata, queries, errors
//! - `rowgraph-cache`: the shared snapshot store
//! - `rowgraph-session`: contexts, objects, faults, commit, prefetch
//! - `rowgraph-memory` (feature `memory`): an in-memory executor

mod config;

pub use config::DomainConfig;

pub use rowgraph_core::{
    AttributeInfo, BatchOperation, ColumnPair, CommitError, CompareOp, DataRow, DeleteBatch, DeleteRule,
    Discriminator, EntityInfo, EntityResolver, Error, ExecutorTransaction, FromValue, InsertBatch,
    JoinStep, LinkTableInfo, LockType, ObjectId, OptimisticLockFailure, OrderBy, PkGenerator, Qualifier,
    QueryError, QueryErrorKind, QueryExecutor, RelationshipInfo, RelationshipKind, Result, RowQuery,
    UpdateBatch, UpdateRow, Value,
};

pub use rowgraph_cache::{CacheStats, SnapshotEvent, SnapshotListener, SnapshotStore, SnapshotStoreConfig};

pub use rowgraph_session::{
    ContextConfig, ContextEvent, DataContext, DataDomain, GraphDiff, LifecycleCallbacks, LifecycleEvent,
    ObjectRef, ObjectSelect, ObjectStore, PaginatedList, PersistenceState, PersistentObject, PrefetchSemantics,
    PrefetchTreeNode, QueryCacheStrategy, QueryResult, ToManySlot, ToOneSlot,
};

#[cfg(feature = "memory")]
pub use rowgraph_memory::{ForeignKey, MemoryDatabase, SequencePkGenerator};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use rowgraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Metadata
        DeleteRule,
        EntityInfo,
        EntityResolver,
        RelationshipInfo,
        // Sessions
        ContextConfig,
        DataContext,
        DataDomain,
        DomainConfig,
        LifecycleEvent,
        ObjectId,
        ObjectRef,
        ObjectSelect,
        PersistenceState,
        PrefetchSemantics,
        QueryCacheStrategy,
        // Queries and values
        DataRow,
        Error,
        OrderBy,
        Qualifier,
        Result,
        Value,
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryDatabase, SequencePkGenerator};

    pub use std::sync::Arc;
}
