//! Data contexts: one session's view of the object graph.
//!
//! A [`DataContext`] owns an [`ObjectStore`] and talks to the database
//! through the domain's [`QueryExecutor`]. Contexts created from one
//! [`DataDomain`] share a [`SnapshotStore`]; a commit in one context updates
//! the shared snapshots and the other contexts apply the resulting event to
//! their own objects.
//!
//! Snapshot events can be posted from any thread. They are queued in the
//! receiving context's inbox and applied by whichever thread next holds the
//! context's store lock, so a listener never blocks on a busy context.
//!
//! A context created with [`DataContext::create_child`] reads through and
//! commits into its parent instead of the database. A child always locks its
//! own store before the parent's.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rowgraph_cache::{SnapshotEvent, SnapshotListener, SnapshotStore, SnapshotStoreConfig, SubscriberId};
use rowgraph_core::{
    DataRow, EntityInfo, EntityResolver, Error, ObjectId, PkGenerator, QueryErrorKind, QueryExecutor,
    Qualifier, RelationshipInfo, Result, RowQuery, pk_for_row,
};

use crate::config::ContextConfig;
use crate::diff::GraphDiff;
use crate::domain::DataDomain;
use crate::events::{ContextEvent, ContextEvents};
use crate::lifecycle::{LifecycleCallbacks, LifecycleEvent};
use crate::object::{ObjectData, ObjectRef, PersistenceState, PersistentObject};
use crate::object_store::ObjectStore;
use crate::paginated::PaginatedList;
use crate::query::{ObjectSelect, QueryResult};
use crate::query_cache::QueryCache;

/// Collaborators a context is built from, taken from a domain or a parent.
struct ContextParts {
    resolver: Arc<EntityResolver>,
    executor: Arc<dyn QueryExecutor>,
    pk_generator: Arc<dyn PkGenerator>,
    snapshots: Arc<SnapshotStore>,
    callbacks: Arc<LifecycleCallbacks>,
    shared_queries: Arc<QueryCache<Vec<DataRow>>>,
}

/// Shared state of a context, referenced weakly by its objects.
pub(crate) struct ContextInner {
    pub(crate) resolver: Arc<EntityResolver>,
    pub(crate) executor: Arc<dyn QueryExecutor>,
    pub(crate) pk_generator: Arc<dyn PkGenerator>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) config: ContextConfig,
    pub(crate) callbacks: Arc<LifecycleCallbacks>,
    /// Context this one reads through and commits into.
    pub(crate) parent: Option<Arc<ContextInner>>,
    pub(crate) local_queries: QueryCache<QueryResult>,
    pub(crate) shared_queries: Arc<QueryCache<Vec<DataRow>>>,
    subscriber: OnceLock<SubscriberId>,
    this: Weak<ContextInner>,
    store: Mutex<ObjectStore>,
    inbox: Mutex<Vec<SnapshotEvent>>,
    events: Mutex<ContextEvents>,
    queued: Mutex<Vec<(LifecycleEvent, ObjectRef)>>,
}

impl ContextInner {
    pub(crate) fn weak(&self) -> Weak<ContextInner> {
        self.this.clone()
    }

    pub(crate) fn subscriber(&self) -> Option<SubscriberId> {
        self.subscriber.get().copied()
    }

    /// Run `f` with the store locked, applying queued snapshot events first.
    /// Lifecycle callbacks queued meanwhile run after the store is released.
    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut ObjectStore) -> R) -> R {
        let result = {
            let mut store = self.store.lock();
            self.drain_inbox(&mut store);
            let result = f(&mut store);
            self.drain_inbox(&mut store);
            result
        };
        // events queued between the last drain and the unlock
        self.flush_inbox();
        self.run_queued_callbacks();
        result
    }

    /// Deliver `event` for `object` once the store is released.
    pub(crate) fn queue_callback(&self, event: LifecycleEvent, object: &ObjectRef) {
        if self.callbacks.has(event) {
            self.queued.lock().push((event, Arc::clone(object)));
        }
    }

    fn run_queued_callbacks(&self) {
        loop {
            let batch = std::mem::take(&mut *self.queued.lock());
            if batch.is_empty() {
                return;
            }
            for (event, object) in batch {
                if let Err(e) = self.callbacks.fire(&self.resolver, event, &object) {
                    tracing::warn!(event = ?event, id = ?object.object_id(), error = %e, "Lifecycle callback failed");
                }
            }
        }
    }

    /// Run `PrePersist` and `PreUpdate` for the pending NEW and MODIFIED
    /// objects. An error stops the commit.
    fn run_pre_commit_callbacks(&self) -> Result<()> {
        if !self.callbacks.has(LifecycleEvent::PrePersist) && !self.callbacks.has(LifecycleEvent::PreUpdate) {
            return Ok(());
        }
        let targets: Vec<(LifecycleEvent, ObjectRef)> = self.with_store(|store| {
            store
                .pending()
                .into_iter()
                .filter(|diff| !diff.is_noop())
                .filter_map(|diff| match diff.object.read().state {
                    PersistenceState::New => Some((LifecycleEvent::PrePersist, Arc::clone(&diff.object))),
                    PersistenceState::Modified => Some((LifecycleEvent::PreUpdate, Arc::clone(&diff.object))),
                    _ => None,
                })
                .collect()
        });
        for (event, object) in &targets {
            self.callbacks.fire(&self.resolver, *event, object)?;
        }
        Ok(())
    }

    /// Commit pending changes: into the parent and on up to the database for
    /// a child, straight to the database otherwise.
    pub(crate) fn commit(&self) -> Result<()> {
        self.fire(ContextEvent::BeforeCommit)?;
        match &self.parent {
            Some(parent) => {
                self.with_store(|store| self.commit_to_parent_in(store, parent))?;
                let adopted = self.with_store(|store| Self::temporary_nodes(store));
                let pairs = parent.with_store(|ps| {
                    adopted
                        .into_iter()
                        .filter_map(|(child, id)| ps.get_node(&id).map(|node| (child, id, node)))
                        .collect::<Vec<_>>()
                });
                parent.commit()?;
                self.with_store(|store| Self::adopt_permanent_ids(store, &pairs));
            }
            None => {
                self.run_pre_commit_callbacks()?;
                self.with_store(|store| self.commit_in(store))?;
            }
        }
        self.fire(ContextEvent::AfterCommit)
    }

    /// Apply queued snapshot events unless another thread holds the store;
    /// that thread drains the inbox before releasing it.
    pub(crate) fn flush_inbox(&self) {
        while !self.inbox.lock().is_empty() {
            match self.store.try_lock() {
                Some(mut store) => self.drain_inbox(&mut store),
                None => return,
            }
        }
    }

    fn drain_inbox(&self, store: &mut ObjectStore) {
        let events = std::mem::take(&mut *self.inbox.lock());
        for event in &events {
            self.apply_snapshot_event(store, event);
        }
    }

    fn fire(&self, event: ContextEvent) -> Result<()> {
        self.events.lock().fire(event)
    }

    // ========================================================================
    // Metadata and row helpers
    // ========================================================================

    pub(crate) fn entity(&self, name: &str) -> Result<Arc<EntityInfo>> {
        self.resolver.entity(name).cloned()
    }

    pub(crate) fn relationship(&self, entity: &EntityInfo, name: &str) -> Result<RelationshipInfo> {
        entity
            .relationship_info(name)
            .cloned()
            .ok_or_else(|| Error::unknown_property(&entity.name, name))
    }

    /// Id of the row under `entity`'s primary key.
    pub(crate) fn id_for_row(&self, entity: &EntityInfo, row: &DataRow) -> Result<ObjectId> {
        pk_for_row(entity, row)
            .map(|key| ObjectId::new(entity.name.clone(), key))
            .ok_or_else(|| {
                Error::query(
                    QueryErrorKind::Database,
                    format!("row of '{}' has no primary key value", entity.name),
                )
            })
    }

    /// Cached snapshot for `id` or one of its subentity variants. A child
    /// context caches nothing and always asks its parent.
    pub(crate) fn cached_row(&self, id: &ObjectId) -> Option<(ObjectId, Arc<DataRow>)> {
        if self.parent.is_some() {
            return None;
        }
        if let Some(row) = self.snapshots.get(id) {
            return Some((id.clone(), row));
        }
        if !self.resolver.has_subentities(id.entity_name()) {
            return None;
        }
        self.resolver
            .entities()
            .filter(|e| e.name != id.entity_name() && self.resolver.is_kind_of(&e.name, id.entity_name()))
            .find_map(|e| {
                let variant = id.with_entity(&e.name);
                self.snapshots.get(&variant).map(|row| (variant, row))
            })
    }

    /// Select the row of `id` from the database, or from the parent's
    /// current state of the object in a child context.
    pub(crate) fn fetch_row(&self, entity: &EntityInfo, id: &ObjectId) -> Result<Option<DataRow>> {
        if let Some(parent) = &self.parent {
            return parent.row_for_child(id);
        }
        let qualifier =
            Qualifier::matching(id.key_values()).and(self.resolver.entity_qualifier(&entity.name));
        let mut rows = self.executor.select(&RowQuery::new(entity.table.clone(), qualifier))?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop().map(|r| r.root_columns())),
            n => Err(Error::query(
                QueryErrorKind::TooManyRows,
                format!("{} rows share the id {}", n, id),
            )),
        }
    }

    /// Last committed row of a registered object: the cached snapshot, or a
    /// fresh select that is cached on the way. `None` if the row is gone.
    pub(crate) fn committed_row(&self, entity: &EntityInfo, id: &ObjectId) -> Result<Option<Arc<DataRow>>> {
        if self.parent.is_some() {
            return Ok(self.fetch_row(entity, id)?.map(Arc::new));
        }
        if let Some(row) = self.snapshots.get(id) {
            return Ok(Some(row));
        }
        let Some(row) = self.fetch_row(entity, id)? else {
            return Ok(None);
        };
        self.snapshots
            .rows_fetched(self.subscriber(), vec![(id.clone(), row.clone())], false);
        Ok(Some(self.snapshots.peek(id).unwrap_or_else(|| Arc::new(row))))
    }

    /// Register a fresh NEW object.
    pub(crate) fn insert_new_object(&self, store: &mut ObjectStore, entity: Arc<EntityInfo>) -> ObjectRef {
        let id = ObjectId::temporary(entity.name.clone());
        self.insert_new_object_as(store, id, entity)
    }

    /// Register a NEW object under a given temporary id.
    pub(crate) fn insert_new_object_as(
        &self,
        store: &mut ObjectStore,
        id: ObjectId,
        entity: Arc<EntityInfo>,
    ) -> ObjectRef {
        let data = ObjectData::new_object(id.clone(), entity);
        let object = PersistentObject::create(data, self.weak());
        store.register_node(id.clone(), Arc::clone(&object));
        store.ensure_diff(&id, &object, None);
        store.register_diff(&id, GraphDiff::NodeCreated(id.clone()));
        self.queue_callback(LifecycleEvent::PostAdd, &object);
        object
    }

    /// Object for `id` in this context, creating a HOLLOW or COMMITTED one if
    /// none is registered.
    pub(crate) fn local_object_in(&self, store: &mut ObjectStore, id: &ObjectId) -> Result<ObjectRef> {
        if let Some(parent) = &self.parent {
            return self.child_local_object_in(store, parent, id);
        }
        if id.is_temporary() {
            return Err(Error::InvalidPrototypeId(id.clone()));
        }
        if let Some(existing) = store.find_registered(&self.resolver, id) {
            return Ok(existing);
        }
        let entity = self.entity(id.entity_name())?;
        if let Some((cached_id, row)) = self.cached_row(id) {
            let leaf = self.entity(cached_id.entity_name())?;
            return self.register_row(store, &leaf, cached_id, &row, row.version(), false);
        }
        if self.resolver.has_subentities(&entity.name) {
            // the concrete entity is only known from the row
            if let Some(row) = self.fetch_row(&entity, id)? {
                let objects = self.objects_from_rows(store, &entity, &[row], false)?;
                if let Some(object) = objects.into_iter().next() {
                    return Ok(object);
                }
            }
        }
        let data = ObjectData::faulted(id.clone(), entity, PersistenceState::Hollow);
        let object = PersistentObject::create(data, self.weak());
        store.register_node(id.clone(), Arc::clone(&object));
        Ok(object)
    }
}

impl SnapshotListener for ContextInner {
    fn snapshots_changed(&self, event: &SnapshotEvent) {
        if self.subscriber().is_some_and(|s| event.posted_by(s)) {
            return;
        }
        self.inbox.lock().push(event.clone());
        self.flush_inbox();
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(subscriber) = self.subscriber.get() {
            self.snapshots.unsubscribe(*subscriber);
        }
    }
}

// ============================================================================
// Data Context
// ============================================================================

/// A session over the object graph.
///
/// Objects fetched or created through a context are registered in it, at
/// most one per [`ObjectId`]. Changes accumulate until
/// [`commit_changes`](Self::commit_changes) writes them in one transaction
/// or [`rollback_changes`](Self::rollback_changes) discards them.
pub struct DataContext {
    inner: Arc<ContextInner>,
}

impl DataContext {
    /// Create a context using the domain's collaborators and configuration.
    pub fn new(domain: &DataDomain) -> Self {
        Self::with_config(domain, domain.context_config().clone())
    }

    /// Create a context with its own configuration.
    pub fn with_config(domain: &DataDomain, config: ContextConfig) -> Self {
        let snapshots = if config.use_shared_cache {
            Arc::clone(domain.snapshot_store())
        } else {
            Arc::new(domain.private_snapshot_store())
        };
        let parts = ContextParts {
            resolver: Arc::clone(domain.resolver()),
            executor: Arc::clone(domain.executor()),
            pk_generator: Arc::clone(domain.pk_generator()),
            snapshots,
            callbacks: Arc::clone(domain.callbacks()),
            shared_queries: Arc::clone(domain.shared_queries()),
        };
        Self::build(parts, config, None)
    }

    fn build(parts: ContextParts, config: ContextConfig, parent: Option<Arc<ContextInner>>) -> Self {
        let inner = Arc::new_cyclic(|this| ContextInner {
            resolver: parts.resolver,
            executor: parts.executor,
            pk_generator: parts.pk_generator,
            snapshots: parts.snapshots,
            local_queries: QueryCache::new(config.query_cache_size),
            config,
            callbacks: parts.callbacks,
            parent,
            shared_queries: parts.shared_queries,
            subscriber: OnceLock::new(),
            this: this.clone(),
            store: Mutex::new(ObjectStore::new()),
            inbox: Mutex::new(Vec::new()),
            events: Mutex::new(ContextEvents::default()),
            queued: Mutex::new(Vec::new()),
        });
        let listener: Weak<dyn SnapshotListener> = Arc::downgrade(&inner) as Weak<dyn SnapshotListener>;
        let subscriber = inner.snapshots.subscribe(listener);
        let _ = inner.subscriber.set(subscriber);
        tracing::debug!(
            subscriber = %subscriber,
            store = inner.snapshots.name(),
            nested = inner.parent.is_some(),
            "Created data context"
        );
        Self { inner }
    }

    /// A context nested in this one.
    ///
    /// The child fetches through this context, so it sees this context's
    /// uncommitted changes, and [`commit_changes_to_parent`] hands its own
    /// changes back without touching the database. Its configuration and
    /// lifecycle callbacks are this context's.
    ///
    /// [`commit_changes_to_parent`]: Self::commit_changes_to_parent
    pub fn create_child(&self) -> DataContext {
        let parent = &self.inner;
        let parts = ContextParts {
            resolver: Arc::clone(&parent.resolver),
            executor: Arc::clone(&parent.executor),
            pk_generator: Arc::clone(&parent.pk_generator),
            snapshots: Arc::new(SnapshotStore::new(SnapshotStoreConfig::default().name("child"))),
            callbacks: Arc::clone(&parent.callbacks),
            shared_queries: Arc::clone(&parent.shared_queries),
        };
        Self::build(parts, parent.config.clone(), Some(Arc::clone(parent)))
    }

    /// True for a context created with [`create_child`](Self::create_child).
    pub fn is_nested(&self) -> bool {
        self.inner.parent.is_some()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.inner.resolver
    }

    /// The snapshot store this context reads and updates.
    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.inner.snapshots
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query, resolving rows to objects and processing prefetches.
    #[tracing::instrument(level = "debug", skip(self, select), fields(entity = %select.entity))]
    pub fn perform_query(&self, select: &ObjectSelect) -> Result<QueryResult> {
        self.inner
            .with_store(|store| self.inner.perform_query_in(store, select))
    }

    /// Run a query expected to return objects.
    pub fn select(&self, select: &ObjectSelect) -> Result<Vec<ObjectRef>> {
        self.perform_query(select).map(QueryResult::into_objects)
    }

    /// Object for `id`: the registered one, else one built from the cached
    /// snapshot, else one fetched from the database. `None` if no row exists.
    pub fn object_for_id(&self, id: &ObjectId) -> Result<Option<ObjectRef>> {
        self.inner
            .with_store(|store| self.inner.object_for_id_in(store, id))
    }

    /// Run a query whose objects are resolved one page at a time.
    ///
    /// Only the ids are fetched up front, together with the first page of
    /// [`ObjectSelect::page_size`] objects. Other pages are fetched when an
    /// element on them is first read.
    #[tracing::instrument(level = "debug", skip(self, select), fields(entity = %select.entity))]
    pub fn select_pages(&self, select: &ObjectSelect) -> Result<PaginatedList> {
        PaginatedList::fetch(&self.inner, select)
    }

    /// Drop the cached query results tagged with `group`, here and in the
    /// domain's shared query cache.
    pub fn remove_cache_group(&self, group: &str) {
        let local = self.inner.local_queries.remove_group(group);
        let shared = self.inner.shared_queries.remove_group(group);
        tracing::debug!(group, local, shared, "Removed query cache group");
    }

    /// Drop every query result cached by this context.
    pub fn clear_query_cache(&self) {
        self.inner.local_queries.clear();
    }

    // ========================================================================
    // Graph changes
    // ========================================================================

    /// Create and register a NEW object with a temporary id.
    pub fn new_object(&self, entity: &str) -> Result<ObjectRef> {
        let info = self.inner.entity(entity)?;
        if info.is_abstract {
            return Err(Error::metadata(
                Some(entity),
                format!("cannot instantiate abstract entity '{}'", entity),
            ));
        }
        Ok(self
            .inner
            .with_store(|store| self.inner.insert_new_object(store, info)))
    }

    pub fn delete_object(&self, object: &ObjectRef) -> Result<()> {
        self.delete_objects(std::slice::from_ref(object))
    }

    /// Mark objects DELETED, applying the delete rules of their
    /// relationships. NEW objects are simply forgotten.
    pub fn delete_objects(&self, objects: &[ObjectRef]) -> Result<()> {
        self.inner.with_store(|store| {
            for object in objects {
                self.inner.delete_in(store, object)?;
            }
            Ok(())
        })
    }

    /// Write every pending change in one transaction.
    ///
    /// A child context first hands its changes to its parent and then
    /// commits the parent, so the parent's own changes are written too.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit_changes(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Apply this child context's changes to its parent without writing
    /// anything to the database. The child's objects become COMMITTED; the
    /// parent's copies carry the changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit_changes_to_parent(&self) -> Result<()> {
        let Some(parent) = &self.inner.parent else {
            return Err(Error::state(None, "context has no parent to commit into"));
        };
        self.inner
            .with_store(|store| self.inner.commit_to_parent_in(store, parent))
    }

    /// Discard every pending change.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback_changes(&self) -> Result<()> {
        self.inner.with_store(|store| self.inner.rollback_in(store));
        self.inner.fire(ContextEvent::AfterRollback)
    }

    /// Turn objects HOLLOW and drop their cached snapshots, here and in every
    /// context sharing the snapshot store.
    #[tracing::instrument(level = "debug", skip(self, objects), fields(count = objects.len()))]
    pub fn invalidate_objects(&self, objects: &[ObjectRef]) -> Result<()> {
        self.inner
            .with_store(|store| self.inner.invalidate_in(store, objects))
    }

    /// This context's copy of an object registered elsewhere.
    ///
    /// An object already registered here is returned as is, whatever state
    /// the prototype is in.
    #[tracing::instrument(level = "debug", skip(self, prototype))]
    pub fn local_object(&self, prototype: &ObjectRef) -> Result<ObjectRef> {
        let id = prototype
            .object_id()
            .ok_or_else(|| Error::state(None, "prototype object has no id"))?;
        self.local_object_by_id(&id)
    }

    /// This context's object for `id`, created HOLLOW (or COMMITTED when a
    /// snapshot is cached) if none is registered.
    ///
    /// A child context also accepts the temporary id of an object created in
    /// its parent.
    pub fn local_object_by_id(&self, id: &ObjectId) -> Result<ObjectRef> {
        if id.is_temporary() && self.inner.parent.is_none() {
            return Err(Error::InvalidPrototypeId(id.clone()));
        }
        self.inner
            .with_store(|store| self.inner.local_object_in(store, id))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn has_changes(&self) -> bool {
        self.inner.with_store(|store| store.has_changes())
    }

    pub fn get_node(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.inner.with_store(|store| store.get_node(id))
    }

    pub fn registered_objects_count(&self) -> usize {
        self.inner.with_store(|store| store.registered_objects_count())
    }

    pub fn changes_by_object_id(&self) -> HashMap<ObjectId, Vec<GraphDiff>> {
        self.inner.with_store(|store| store.changes_by_object_id())
    }

    pub fn objects_in_state(&self, state: PersistenceState) -> Vec<ObjectRef> {
        self.inner.with_store(|store| {
            let mut objects: Vec<ObjectRef> = store
                .registered_objects()
                .filter(|o| o.read().state == state)
                .cloned()
                .collect();
            objects.sort_by_key(|o| o.object_id().map(|id| id.to_string()));
            objects
        })
    }

    pub fn new_objects(&self) -> Vec<ObjectRef> {
        self.objects_in_state(PersistenceState::New)
    }

    pub fn modified_objects(&self) -> Vec<ObjectRef> {
        self.objects_in_state(PersistenceState::Modified)
    }

    pub fn deleted_objects(&self) -> Vec<ObjectRef> {
        self.objects_in_state(PersistenceState::Deleted)
    }

    #[cfg(test)]
    pub(crate) fn with_object_store<R>(&self, f: impl FnOnce(&mut ObjectStore) -> R) -> R {
        self.inner.with_store(f)
    }

    /// The shared (or private) snapshot cached for `id`.
    pub fn get_cached_snapshot(&self, id: &ObjectId) -> Option<Arc<DataRow>> {
        self.inner.snapshots.get(id)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a callback to run before commit.
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.inner
            .events
            .lock()
            .register(ContextEvent::BeforeCommit, Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.inner
            .events
            .lock()
            .register(ContextEvent::AfterCommit, Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.inner
            .events
            .lock()
            .register(ContextEvent::AfterRollback, Box::new(f));
    }
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("subscriber", &self.inner.subscriber())
            .field("store", &self.inner.snapshots.name())
            .field("nested", &self.inner.parent.is_some())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
