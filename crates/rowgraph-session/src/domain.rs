//! The shared environment contexts are created from.

use std::sync::Arc;

use rowgraph_cache::{SnapshotStore, SnapshotStoreConfig};
use rowgraph_core::{DataRow, EntityResolver, PkGenerator, QueryExecutor};

use crate::config::ContextConfig;
use crate::context::DataContext;
use crate::lifecycle::LifecycleCallbacks;
use crate::query_cache::QueryCache;

/// Resolved metadata, database collaborators and the state shared by every
/// context: the snapshot store, the shared query cache and the lifecycle
/// callbacks.
///
/// Passed explicitly to every context; there is no global registry.
pub struct DataDomain {
    resolver: Arc<EntityResolver>,
    executor: Arc<dyn QueryExecutor>,
    pk_generator: Arc<dyn PkGenerator>,
    cache_config: SnapshotStoreConfig,
    snapshots: Arc<SnapshotStore>,
    context_config: ContextConfig,
    callbacks: Arc<LifecycleCallbacks>,
    shared_queries: Arc<QueryCache<Vec<DataRow>>>,
}

impl DataDomain {
    /// Domain with an unbounded shared snapshot store.
    pub fn new(
        resolver: EntityResolver,
        executor: Arc<dyn QueryExecutor>,
        pk_generator: Arc<dyn PkGenerator>,
    ) -> Self {
        let cache_config = SnapshotStoreConfig::default();
        let context_config = ContextConfig::default();
        Self {
            resolver: Arc::new(resolver),
            executor,
            pk_generator,
            snapshots: Arc::new(SnapshotStore::new(cache_config.clone())),
            cache_config,
            shared_queries: Arc::new(QueryCache::new(context_config.query_cache_size)),
            context_config,
            callbacks: Arc::new(LifecycleCallbacks::default()),
        }
    }

    /// Replace the shared snapshot store with one built from `config`.
    #[must_use]
    pub fn with_cache_config(mut self, config: SnapshotStoreConfig) -> Self {
        self.snapshots = Arc::new(SnapshotStore::new(config.clone()));
        self.cache_config = config;
        self
    }

    /// Configuration given to contexts created with [`create_context`](Self::create_context).
    /// Its `query_cache_size` also sizes the shared query cache.
    #[must_use]
    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.shared_queries = Arc::new(QueryCache::new(config.query_cache_size));
        self.context_config = config;
        self
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn executor(&self) -> &Arc<dyn QueryExecutor> {
        &self.executor
    }

    pub fn pk_generator(&self) -> &Arc<dyn PkGenerator> {
        &self.pk_generator
    }

    /// The snapshot store shared by contexts using the shared cache.
    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn context_config(&self) -> &ContextConfig {
        &self.context_config
    }

    /// Lifecycle callbacks fired in every context of this domain.
    pub fn callbacks(&self) -> &Arc<LifecycleCallbacks> {
        &self.callbacks
    }

    pub(crate) fn shared_queries(&self) -> &Arc<QueryCache<Vec<DataRow>>> {
        &self.shared_queries
    }

    /// Drop the shared query results tagged with `group`.
    pub fn remove_cache_group(&self, group: &str) {
        let removed = self.shared_queries.remove_group(group);
        tracing::debug!(group, removed, "Removed shared query cache group");
    }

    /// A new, empty store sized like the shared one.
    pub(crate) fn private_snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.cache_config.clone().name("private"))
    }

    pub fn create_context(&self) -> DataContext {
        DataContext::new(self)
    }

    pub fn create_context_with(&self, config: ContextConfig) -> DataContext {
        DataContext::with_config(self, config)
    }
}

impl std::fmt::Debug for DataDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDomain")
            .field("entities", &self.resolver.entities().count())
            .field("snapshots", &self.snapshots)
            .field("context_config", &self.context_config)
            .field("callbacks", &self.callbacks)
            .field("shared_queries", &self.shared_queries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gallery, seed_artists};
    use crate::ObjectSelect;
    use rowgraph_core::ObjectId;

    #[test]
    fn test_contexts_share_the_domain_store() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let a = fixture.context();
        let b = fixture.context();
        assert!(Arc::ptr_eq(a.snapshot_store(), b.snapshot_store()));
        assert_eq!(fixture.domain.snapshot_store().subscriber_count(), 2);

        a.select(&ObjectSelect::query("Artist")).unwrap();
        let id = ObjectId::single("Artist", "ARTIST_ID", 1);
        assert!(b.get_cached_snapshot(&id).is_some());

        drop(a);
        assert_eq!(fixture.domain.snapshot_store().subscriber_count(), 1);
    }

    #[test]
    fn test_isolated_context_has_private_store() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let shared = fixture.context();
        let private = fixture.domain.create_context_with(ContextConfig::isolated());
        assert!(!Arc::ptr_eq(shared.snapshot_store(), private.snapshot_store()));

        private.select(&ObjectSelect::query("Artist")).unwrap();
        let id = ObjectId::single("Artist", "ARTIST_ID", 1);
        assert!(private.get_cached_snapshot(&id).is_some());
        assert!(shared.get_cached_snapshot(&id).is_none());
    }

    #[test]
    fn test_bounded_cache_config() {
        let fixture = gallery();
        let domain = fixture
            .domain
            .with_cache_config(SnapshotStoreConfig::bounded(2));
        assert_eq!(domain.snapshot_store().maximum_size(), Some(2));
    }
}
