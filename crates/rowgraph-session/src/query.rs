//! Object queries and row-to-object resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rowgraph_core::{DataRow, EntityInfo, ObjectId, OrderBy, Qualifier, Result, RowQuery};

use crate::context::ContextInner;
use crate::lifecycle::LifecycleEvent;
use crate::object::{ObjectData, ObjectRef, PersistenceState, PersistentObject};
use crate::object_store::ObjectStore;
use crate::prefetch::{PrefetchSemantics, PrefetchTreeNode};
use crate::query_cache::QueryCacheStrategy;

/// A select of objects (or raw rows) of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSelect {
    pub entity: String,
    /// Restriction over the entity table's columns.
    pub qualifier: Qualifier,
    pub ordering: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub prefetch: Option<PrefetchTreeNode>,
    /// Return rows instead of objects; prefetches are ignored.
    pub fetch_data_rows: bool,
    /// Make the fetched rows the lock baseline of registered MODIFIED
    /// objects. Fetched rows are merged into registered objects either way.
    pub refresh: bool,
    pub cache_strategy: QueryCacheStrategy,
    /// Groups the cached result is tagged with.
    pub cache_groups: Vec<String>,
    /// Page size of [`DataContext::select_pages`](crate::DataContext::select_pages).
    pub page_size: Option<usize>,
}

impl ObjectSelect {
    pub fn query(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            ordering: Vec::new(),
            limit: None,
            offset: None,
            prefetch: None,
            fetch_data_rows: false,
            refresh: false,
            cache_strategy: QueryCacheStrategy::NoCache,
            cache_groups: Vec::new(),
            page_size: None,
        }
    }

    /// AND a restriction onto the query.
    #[must_use]
    pub fn filter(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = std::mem::replace(&mut self.qualifier, Qualifier::All).and(qualifier);
        self
    }

    #[must_use]
    pub fn order_by(mut self, ordering: OrderBy) -> Self {
        self.ordering.push(ordering);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Prefetch a dotted relationship path, e.g. `"paintings.gallery"`.
    #[must_use]
    pub fn prefetch(mut self, path: &str, semantics: PrefetchSemantics) -> Self {
        self.prefetch
            .get_or_insert_with(PrefetchTreeNode::root)
            .add_path(path, semantics);
        self
    }

    #[must_use]
    pub fn data_rows(mut self) -> Self {
        self.fetch_data_rows = true;
        self
    }

    #[must_use]
    pub fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    /// Cache the result, tagged with `groups`.
    #[must_use]
    pub fn cache(mut self, strategy: QueryCacheStrategy, groups: &[&str]) -> Self {
        self.cache_strategy = strategy;
        self.cache_groups = groups.iter().map(|g| (*g).to_string()).collect();
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Key of the result in a query cache: every part of the select that
    /// changes its result.
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}|{:?}|{:?}|{:?}|{:?}|{}",
            self.entity, self.qualifier, self.ordering, self.limit, self.offset, self.prefetch, self.fetch_data_rows
        )
    }
}

/// Result of [`DataContext::perform_query`](crate::DataContext::perform_query).
#[derive(Debug, Clone)]
pub enum QueryResult {
    Objects(Vec<ObjectRef>),
    DataRows(Vec<DataRow>),
}

impl QueryResult {
    /// The objects; empty for a row query.
    pub fn into_objects(self) -> Vec<ObjectRef> {
        match self {
            QueryResult::Objects(objects) => objects,
            QueryResult::DataRows(_) => Vec::new(),
        }
    }

    /// The rows; empty for an object query.
    pub fn into_data_rows(self) -> Vec<DataRow> {
        match self {
            QueryResult::Objects(_) => Vec::new(),
            QueryResult::DataRows(rows) => rows,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryResult::Objects(objects) => objects.len(),
            QueryResult::DataRows(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Objects in first-seen order, each once.
pub(crate) fn unique(objects: &[ObjectRef]) -> Vec<ObjectRef> {
    let mut seen = HashSet::new();
    objects
        .iter()
        .filter(|o| seen.insert(Arc::as_ptr(o)))
        .cloned()
        .collect()
}

/// Attribute values of `entity` read from `row`.
pub(crate) fn values_from_row(
    entity: &EntityInfo,
    row: &DataRow,
) -> std::collections::BTreeMap<String, rowgraph_core::Value> {
    entity
        .attributes
        .iter()
        .map(|a| (a.name.clone(), row.get(&a.column).cloned().unwrap_or_default()))
        .collect()
}

impl ContextInner {
    /// Run `select`, going through the query cache its strategy names.
    pub(crate) fn perform_query_in(&self, store: &mut ObjectStore, select: &ObjectSelect) -> Result<QueryResult> {
        let strategy = select.cache_strategy;
        if strategy.is_local() {
            let key = select.cache_key();
            if !strategy.is_refresh() {
                if let Some(cached) = self.local_queries.get(&key) {
                    return Ok(Self::still_registered(store, cached));
                }
            }
            let result = self.fetch_query_in(store, select)?;
            self.local_queries.put(key, result.clone(), &select.cache_groups);
            return Ok(result);
        }
        if strategy.is_shared() {
            if let Some(parent) = &self.parent {
                // the parent owns the lookup in the shared cache
                return self.child_query_in(store, parent, select);
            }
            let key = select.cache_key();
            if !strategy.is_refresh() {
                if let Some(rows) = self.shared_queries.get(&key) {
                    return self.result_from_cached_rows(store, select, &rows);
                }
            }
            let (result, rows) = self.select_from_database(store, select)?;
            self.shared_queries.put(key, rows, &select.cache_groups);
            return Ok(result);
        }
        self.fetch_query_in(store, select)
    }

    /// Run `select` without looking at any cache.
    fn fetch_query_in(&self, store: &mut ObjectStore, select: &ObjectSelect) -> Result<QueryResult> {
        if let Some(parent) = &self.parent {
            let mut uncached = select.clone();
            uncached.cache_strategy = QueryCacheStrategy::NoCache;
            return self.child_query_in(store, parent, &uncached);
        }
        self.select_from_database(store, select).map(|(result, _)| result)
    }

    /// A cached local result without the objects unregistered or deleted
    /// since it was stored.
    fn still_registered(store: &ObjectStore, cached: QueryResult) -> QueryResult {
        match cached {
            QueryResult::Objects(objects) => QueryResult::Objects(
                objects
                    .into_iter()
                    .filter(|o| {
                        let registered = o
                            .object_id()
                            .and_then(|id| store.get_node(&id))
                            .is_some_and(|node| Arc::ptr_eq(&node, o));
                        registered && o.read().state != PersistenceState::Deleted
                    })
                    .collect(),
            ),
            rows @ QueryResult::DataRows(_) => rows,
        }
    }

    /// Objects for rows cached in the shared query cache. A newer snapshot
    /// of a row takes precedence over the cached copy.
    fn result_from_cached_rows(
        &self,
        store: &mut ObjectStore,
        select: &ObjectSelect,
        rows: &[DataRow],
    ) -> Result<QueryResult> {
        if select.fetch_data_rows {
            return Ok(QueryResult::DataRows(rows.to_vec()));
        }
        let base = self.entity(&select.entity)?;
        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            let leaf = Arc::clone(self.resolver.leaf_entity(&base.name, row)?);
            let id = self.id_for_row(&leaf, row)?;
            let object = match self.snapshots.get(&id) {
                Some(current) => self.register_row(store, &leaf, id, &current, current.version(), false)?,
                None => self.register_row(store, &leaf, id, row, row.version(), false)?,
            };
            objects.push(object);
        }
        tracing::debug!(objects = objects.len(), "Resolved shared cached rows");
        Ok(QueryResult::Objects(unique(&objects)))
    }

    /// Run `select` against the database; also returns the root rows.
    fn select_from_database(
        &self,
        store: &mut ObjectStore,
        select: &ObjectSelect,
    ) -> Result<(QueryResult, Vec<DataRow>)> {
        let entity = self.entity(&select.entity)?;
        let mut query = RowQuery::new(
            entity.table.clone(),
            select
                .qualifier
                .clone()
                .and(self.resolver.entity_qualifier(&entity.name)),
        );
        query.ordering = select.ordering.clone();
        query.limit = select.limit;
        query.offset = select.offset;

        if select.fetch_data_rows {
            let rows: Vec<DataRow> = self.executor.select(&query)?.iter().map(DataRow::root_columns).collect();
            tracing::debug!(rows = rows.len(), "Fetched data rows");
            return Ok((QueryResult::DataRows(rows.clone()), rows));
        }

        if let Some(tree) = &select.prefetch {
            query.joints = self.joint_joins(&entity, tree)?;
        }
        let rows = self.executor.select(&query)?;
        let refresh = select.refresh || self.config.refresh_on_query;
        let roots: Vec<DataRow> = rows.iter().map(DataRow::root_columns).collect();
        let aligned = self.objects_from_rows(store, &entity, &roots, refresh)?;
        let objects = unique(&aligned);
        tracing::debug!(rows = rows.len(), objects = objects.len(), "Fetched objects");

        if let Some(tree) = &select.prefetch {
            // a repeated qualifier would not see the limit
            let parent_qualifier =
                (select.limit.is_none() && select.offset.is_none()).then(|| query.qualifier.clone());
            self.prefetch_in(store, &entity, tree, &rows, &aligned, parent_qualifier, refresh)?;
        }
        Ok((QueryResult::Objects(objects), roots))
    }

    pub(crate) fn object_for_id_in(&self, store: &mut ObjectStore, id: &ObjectId) -> Result<Option<ObjectRef>> {
        if let Some(parent) = &self.parent {
            return self.child_object_for_id_in(store, parent, id);
        }
        if id.is_temporary() {
            return Ok(store.get_node(id));
        }
        if let Some(object) = store.find_registered(&self.resolver, id) {
            return Ok(Some(object));
        }
        if let Some((cached_id, row)) = self.cached_row(id) {
            let leaf = self.entity(cached_id.entity_name())?;
            return self
                .register_row(store, &leaf, cached_id, &row, row.version(), false)
                .map(Some);
        }
        let entity = self.entity(id.entity_name())?;
        match self.fetch_row(&entity, id)? {
            Some(row) => Ok(self
                .objects_from_rows(store, &entity, &[row], false)?
                .into_iter()
                .next()),
            None => Ok(None),
        }
    }

    /// Resolve fetched rows of `base` (or its subentities) to objects.
    ///
    /// Returns one object per row; rows repeating an id map to the same
    /// object. Every distinct row is recorded in the snapshot store.
    pub(crate) fn objects_from_rows(
        &self,
        store: &mut ObjectStore,
        base: &EntityInfo,
        rows: &[DataRow],
        rebase: bool,
    ) -> Result<Vec<ObjectRef>> {
        let mut resolved = Vec::with_capacity(rows.len());
        let mut fetched = Vec::new();
        let mut seen = HashSet::new();
        for row in rows {
            let leaf = Arc::clone(self.resolver.leaf_entity(&base.name, row)?);
            let id = self.id_for_row(&leaf, row)?;
            if seen.insert(id.clone()) {
                fetched.push((id.clone(), row.clone()));
            }
            resolved.push((leaf, id));
        }

        let ids: Vec<ObjectId> = fetched.iter().map(|(id, _)| id.clone()).collect();
        let versions = self.snapshots.rows_fetched(self.subscriber(), fetched, true);
        let version_of: HashMap<ObjectId, u64> = ids.into_iter().zip(versions).collect();

        let mut registered: HashMap<ObjectId, ObjectRef> = HashMap::new();
        let mut objects = Vec::with_capacity(rows.len());
        for ((leaf, id), row) in resolved.into_iter().zip(rows) {
            if let Some(object) = registered.get(&id) {
                objects.push(Arc::clone(object));
                continue;
            }
            let version = version_of.get(&id).copied().unwrap_or_else(|| row.version());
            let object = self.register_row(store, &leaf, id.clone(), row, version, rebase)?;
            registered.insert(id, Arc::clone(&object));
            objects.push(object);
        }
        Ok(objects)
    }

    /// Object for a row of the concrete entity `leaf`.
    ///
    /// A registered object is reused and the row merged into it: a HOLLOW
    /// one is filled, a COMMITTED one overwritten, and a MODIFIED or DELETED
    /// one keeps its local edits. With `rebase` the row also becomes the lock
    /// baseline of a changed object. Otherwise a COMMITTED object with
    /// faulted relationships is registered.
    pub(crate) fn register_row(
        &self,
        store: &mut ObjectStore,
        leaf: &Arc<EntityInfo>,
        id: ObjectId,
        row: &DataRow,
        version: u64,
        rebase: bool,
    ) -> Result<ObjectRef> {
        if let Some(existing) = store.get_node(&id) {
            let state = existing.read().state;
            match state {
                PersistenceState::Hollow => self.fill_from_row(&existing, row, version),
                PersistenceState::Committed => {
                    self.refresh_committed(&existing, row, version);
                    self.queue_callback(LifecycleEvent::PostLoad, &existing);
                }
                PersistenceState::Modified | PersistenceState::Deleted => {
                    self.merge_row(store, &existing, row, version, rebase);
                }
                PersistenceState::New | PersistenceState::Transient => {}
            }
            return Ok(existing);
        }

        let mut data = ObjectData::faulted(id.clone(), Arc::clone(leaf), PersistenceState::Committed);
        data.values = values_from_row(leaf, row);
        data.snapshot_version = Some(version);
        let object = PersistentObject::create(data, self.weak());
        store.register_node(id, Arc::clone(&object));
        self.queue_callback(LifecycleEvent::PostLoad, &object);
        Ok(object)
    }

    /// Turn a HOLLOW object COMMITTED with the values of `row`.
    pub(crate) fn fill_from_row(&self, object: &ObjectRef, row: &DataRow, version: u64) {
        {
            let mut data = object.write();
            data.values = values_from_row(&data.entity, row);
            data.state = PersistenceState::Committed;
            data.snapshot_version = Some(version);
        }
        self.queue_callback(LifecycleEvent::PostLoad, object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gallery, seed_artists};
    use rowgraph_core::{CompareOp, Value};

    #[test]
    fn test_query_registers_committed_objects() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet"), (2, "Manet")]);
        let context = fixture.context();

        let artists = context
            .select(&ObjectSelect::query("Artist").order_by(OrderBy::asc("ARTIST_NAME")))
            .unwrap();
        assert_eq!(artists.len(), 2);
        assert_eq!(artists[0].get::<String>("name").unwrap(), "Manet");
        assert_eq!(artists[0].persistence_state(), PersistenceState::Committed);
        assert_eq!(context.registered_objects_count(), 2);

        let id = ObjectId::single("Artist", "ARTIST_ID", 1);
        assert!(context.get_cached_snapshot(&id).is_some());
    }

    #[test]
    fn test_same_row_resolves_to_same_object() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();

        let first = context.select(&ObjectSelect::query("Artist")).unwrap();
        let second = context
            .select(&ObjectSelect::query("Artist").filter(Qualifier::eq("ARTIST_ID", 1)))
            .unwrap();
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(context.registered_objects_count(), 1);
    }

    #[test]
    fn test_query_merges_rows_into_committed_objects() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);

        fixture.db.update_rows(
            "ARTIST",
            &Qualifier::eq("ARTIST_ID", 1),
            &[("ARTIST_NAME", Value::from("Claude Monet"))],
        );
        let again = context.select(&ObjectSelect::query("Artist")).unwrap();
        assert!(Arc::ptr_eq(&again[0], &artist));
        assert_eq!(artist.get::<String>("name").unwrap(), "Claude Monet");
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
    }

    #[test]
    fn test_query_keeps_local_edits_and_lock_baseline() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        artist.write_property("dateOfBirth", "1840").unwrap();

        fixture.db.update_rows(
            "ARTIST",
            &Qualifier::eq("ARTIST_ID", 1),
            &[("ARTIST_NAME", Value::from("Claude Monet"))],
        );
        context.select(&ObjectSelect::query("Artist")).unwrap();
        assert_eq!(artist.get::<String>("name").unwrap(), "Claude Monet");
        assert_eq!(artist.get::<String>("dateOfBirth").unwrap(), "1840");
        assert_eq!(artist.persistence_state(), PersistenceState::Modified);

        // the baseline still holds the name the edit was made against
        let err = context.commit_changes().unwrap_err();
        assert!(err.optimistic_lock_failure().is_some());
    }

    #[test]
    fn test_data_rows_are_not_registered() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet"), (2, "Manet")]);
        let context = fixture.context();

        let rows = context
            .perform_query(
                &ObjectSelect::query("Artist")
                    .filter(Qualifier::compare("ARTIST_ID", CompareOp::Gt, 1))
                    .data_rows(),
            )
            .unwrap()
            .into_data_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("ARTIST_NAME"), Some(&Value::from("Manet")));
        assert_eq!(context.registered_objects_count(), 0);
    }

    #[test]
    fn test_object_for_id_checks_cache_then_database() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let id = ObjectId::single("Artist", "ARTIST_ID", 1);

        let artist = context.object_for_id(&id).unwrap().unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
        assert_eq!(fixture.db.query_count(), 1);

        let other = fixture.context();
        let copy = other.object_for_id(&id).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&artist, &copy));
        // served from the shared snapshot store
        assert_eq!(fixture.db.query_count(), 1);

        let missing = ObjectId::single("Artist", "ARTIST_ID", 99);
        assert!(context.object_for_id(&missing).unwrap().is_none());
    }

    #[test]
    fn test_inheritance_dispatches_to_leaf_entities() {
        let fixture = gallery();
        fixture.db.insert_row(
            "PAINTING",
            DataRow::new()
                .with("PAINTING_ID", 10)
                .with("PAINTING_TITLE", "Sketch")
                .with("KIND", "S"),
        ).unwrap();
        fixture.db.insert_row(
            "PAINTING",
            DataRow::new()
                .with("PAINTING_ID", 11)
                .with("PAINTING_TITLE", "Oil")
                .with("KIND", "P"),
        ).unwrap();
        let context = fixture.context();

        let all = context
            .select(&ObjectSelect::query("Painting").order_by(OrderBy::asc("PAINTING_ID")))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].entity_name(), "Sketch");
        assert_eq!(all[1].entity_name(), "Painting");

        let sketches = context.select(&ObjectSelect::query("Sketch")).unwrap();
        assert_eq!(sketches.len(), 1);
        assert!(Arc::ptr_eq(&sketches[0], &all[0]));
    }

    #[test]
    fn test_local_cache_reuses_result_until_refreshed() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let select = ObjectSelect::query("Artist").cache(QueryCacheStrategy::LocalCache, &["artists"]);

        let first = context.select(&select).unwrap();
        let second = context.select(&select).unwrap();
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(fixture.db.query_count(), 1);

        seed_artists(&fixture.db, &[(2, "Manet")]);
        assert_eq!(context.select(&select).unwrap().len(), 1);
        let mut refresh = select.clone();
        refresh.cache_strategy = QueryCacheStrategy::LocalCacheRefresh;
        assert_eq!(context.select(&refresh).unwrap().len(), 2);
        assert_eq!(context.select(&select).unwrap().len(), 2);
        assert_eq!(fixture.db.query_count(), 2);

        // caches of other contexts are private
        let other = fixture.context();
        other.select(&select).unwrap();
        assert_eq!(fixture.db.query_count(), 3);
    }

    #[test]
    fn test_local_cache_drops_deleted_objects_and_groups() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet"), (2, "Manet")]);
        let context = fixture.context();
        let select = ObjectSelect::query("Artist").cache(QueryCacheStrategy::LocalCache, &["artists"]);
        let artists = context.select(&select).unwrap();

        // the delete rules fetch the relationships
        context.delete_object(&artists[0]).unwrap();
        let queries = fixture.db.query_count();
        assert_eq!(context.select(&select).unwrap().len(), 1);
        assert_eq!(fixture.db.query_count(), queries);

        context.remove_cache_group("artists");
        context.select(&select).unwrap();
        assert_eq!(fixture.db.query_count(), queries + 1);
    }

    #[test]
    fn test_cache_key_tells_selects_apart() {
        let a = ObjectSelect::query("Artist").filter(Qualifier::eq("ARTIST_NAME", "Monet"));
        let b = ObjectSelect::query("Artist").filter(Qualifier::eq("ARTIST_NAME", "Manet"));
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), a.clone().cache(QueryCacheStrategy::LocalCache, &["x"]).cache_key());
        assert_ne!(a.cache_key(), a.clone().limit(1).cache_key());
    }
}
