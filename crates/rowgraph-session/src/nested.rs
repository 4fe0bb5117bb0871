//! Child contexts: reading through a parent context and committing into it.
//!
//! A child never talks to the database. Rows it needs are built from the
//! parent's current objects, uncommitted changes included, and its own
//! changes are replayed on the parent's objects by
//! [`commit_to_parent_in`](ContextInner::commit_to_parent_in). Objects
//! created in the parent keep their temporary ids in the child until the
//! parent commits them.

use std::sync::Arc;

use rowgraph_core::{DataRow, Discriminator, EntityInfo, Error, ObjectId, QueryErrorKind, Result, Value};

use crate::commit::Pending;
use crate::context::ContextInner;
use crate::object::{ObjectData, ObjectRef, PersistenceState, PersistentObject, ToManySlot, ToOneSlot};
use crate::object_store::ObjectStore;
use crate::query::{ObjectSelect, QueryResult, unique};

/// A parent object as seen by a child: its row, or `None` while the parent
/// has not fetched it either.
struct ParentCopy {
    id: ObjectId,
    entity: Arc<EntityInfo>,
    row: Option<DataRow>,
}

enum ParentResult {
    Objects(Vec<ParentCopy>),
    Rows(Vec<DataRow>),
}

fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Query(q) if q.kind == QueryErrorKind::NotFound)
}

impl ContextInner {
    // ========================================================================
    // Parent side
    // ========================================================================

    /// Registered object for `id`, created HOLLOW unless the id is
    /// temporary. Callers hold this context's store.
    fn parent_object_in(&self, store: &mut ObjectStore, id: &ObjectId) -> Result<Option<ObjectRef>> {
        if id.is_temporary() {
            return Ok(store.get_node(id));
        }
        self.local_object_in(store, id).map(Some)
    }

    /// Current row of the object `id` for a child; `None` when the object
    /// is deleted here or its row is gone.
    pub(crate) fn row_for_child(&self, id: &ObjectId) -> Result<Option<DataRow>> {
        self.with_store(|store| {
            let Some(object) = self.parent_object_in(store, id)? else {
                return Ok(None);
            };
            Ok(self.copy_for_child_in(&object, true)?.and_then(|copy| copy.row))
        })
    }

    /// How a child should see `object`. With `resolve` a HOLLOW object is
    /// fetched first; a deleted one has no copy.
    fn copy_for_child_in(&self, object: &ObjectRef, resolve: bool) -> Result<Option<ParentCopy>> {
        if resolve {
            match self.resolve_hollow_in(object) {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let (id, entity, state, values, to_one) = {
            let data = object.read();
            let Some(id) = data.id.clone() else {
                return Ok(None);
            };
            (
                id,
                Arc::clone(&data.entity),
                data.state,
                data.values.clone(),
                data.to_one.clone(),
            )
        };
        match state {
            PersistenceState::Deleted | PersistenceState::Transient => return Ok(None),
            PersistenceState::Hollow => {
                return Ok(Some(ParentCopy { id, entity, row: None }));
            }
            _ => {}
        }

        let mut row = DataRow::new();
        for (column, value) in id.key_values() {
            row.insert(column.clone(), value.clone());
        }
        for attr in &entity.attributes {
            row.insert(attr.column.clone(), values.get(&attr.name).cloned().unwrap_or_default());
        }
        let snapshot = self.snapshots.peek(&id);
        match &entity.discriminator {
            Some(Discriminator::Value { column, value }) => row.insert(column.clone(), value.clone()),
            Some(Discriminator::NotNull { column }) => {
                if let Some(value) = snapshot.as_ref().and_then(|s| s.get(column)) {
                    row.insert(column.clone(), value.clone());
                }
            }
            None => {}
        }
        for rel in entity.fk_relationships().filter(|r| !r.is_to_many()) {
            let Some(step) = rel.first_step() else { continue };
            match to_one.get(&rel.name) {
                Some(ToOneSlot::Resolved(Some(target))) => {
                    // an unsaved target has no key yet; the child resolves it through us
                    let Some(target_id) = target.object_id().filter(|t| !t.is_temporary()) else {
                        continue;
                    };
                    for pair in &step.pairs {
                        if let Some(value) = target_id.key_value(&pair.target) {
                            row.insert(pair.source.clone(), value.clone());
                        }
                    }
                }
                Some(ToOneSlot::Resolved(None)) => {
                    for pair in &step.pairs {
                        row.insert(pair.source.clone(), Value::Null);
                    }
                }
                _ => {
                    for pair in &step.pairs {
                        if let Some(value) = snapshot.as_ref().and_then(|s| s.get(&pair.source)) {
                            row.insert(pair.source.clone(), value.clone());
                        }
                    }
                }
            }
        }
        Ok(Some(ParentCopy {
            id,
            entity,
            row: Some(row),
        }))
    }

    // ========================================================================
    // Child side
    // ========================================================================

    /// Register `copy` in this child, merging it into an existing object.
    fn adopt_in(&self, store: &mut ObjectStore, copy: ParentCopy) -> Result<ObjectRef> {
        let ParentCopy { id, entity, row } = copy;
        if let Some(row) = row {
            return self.register_row(store, &entity, id, &row, row.version(), false);
        }
        if let Some(existing) = store.get_node(&id) {
            return Ok(existing);
        }
        let data = ObjectData::faulted(id.clone(), entity, PersistenceState::Hollow);
        let object = PersistentObject::create(data, self.weak());
        store.register_node(id, Arc::clone(&object));
        Ok(object)
    }

    pub(crate) fn child_local_object_in(
        &self,
        store: &mut ObjectStore,
        parent: &Arc<ContextInner>,
        id: &ObjectId,
    ) -> Result<ObjectRef> {
        if let Some(existing) = store.find_registered(&self.resolver, id) {
            return Ok(existing);
        }
        let copy = parent.with_store(|ps| match parent.parent_object_in(ps, id)? {
            Some(object) => parent.copy_for_child_in(&object, false),
            None => Ok(None),
        })?;
        match copy {
            Some(copy) => self.adopt_in(store, copy),
            None if id.is_temporary() => Err(Error::InvalidPrototypeId(id.clone())),
            None => Err(Error::state(Some(id.clone()), "object is deleted in the parent context")),
        }
    }

    pub(crate) fn child_object_for_id_in(
        &self,
        store: &mut ObjectStore,
        parent: &Arc<ContextInner>,
        id: &ObjectId,
    ) -> Result<Option<ObjectRef>> {
        if let Some(existing) = store.find_registered(&self.resolver, id) {
            return Ok(Some(existing));
        }
        let copy = parent.with_store(|ps| match parent.object_for_id_in(ps, id)? {
            Some(object) => parent.copy_for_child_in(&object, true),
            None => Ok(None),
        })?;
        copy.map(|c| self.adopt_in(store, c)).transpose()
    }

    /// Run `select` in the parent and copy the resulting objects here.
    pub(crate) fn child_query_in(
        &self,
        store: &mut ObjectStore,
        parent: &Arc<ContextInner>,
        select: &ObjectSelect,
    ) -> Result<QueryResult> {
        let result = parent.with_store(|ps| -> Result<ParentResult> {
            match parent.perform_query_in(ps, select)? {
                QueryResult::DataRows(rows) => Ok(ParentResult::Rows(rows)),
                QueryResult::Objects(objects) => {
                    let mut copies = Vec::with_capacity(objects.len());
                    for object in &objects {
                        if let Some(copy) = parent.copy_for_child_in(object, false)? {
                            copies.push(copy);
                        }
                    }
                    Ok(ParentResult::Objects(copies))
                }
            }
        })?;
        match result {
            ParentResult::Rows(rows) => Ok(QueryResult::DataRows(rows)),
            ParentResult::Objects(copies) => {
                let objects = copies
                    .into_iter()
                    .map(|c| self.adopt_in(store, c))
                    .collect::<Result<Vec<_>>>()?;
                tracing::debug!(objects = objects.len(), "Copied objects from parent context");
                Ok(QueryResult::Objects(unique(&objects)))
            }
        }
    }

    /// Target of the to-one `name` of the object `id`, as the parent sees it.
    pub(crate) fn child_to_one_in(
        &self,
        store: &mut ObjectStore,
        parent: &Arc<ContextInner>,
        id: &ObjectId,
        name: &str,
    ) -> Result<Option<ObjectRef>> {
        let stale = || Error::StaleFault {
            owner: id.clone(),
            relationship: name.to_string(),
        };
        let copy = parent.with_store(|ps| -> Result<Option<ParentCopy>> {
            let object = parent.parent_object_in(ps, id)?.ok_or_else(stale)?;
            match parent.resolve_hollow_in(&object) {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => return Err(stale()),
                Err(e) => return Err(e),
            }
            match parent.resolve_to_one_in(ps, &object, name)? {
                Some(target) => parent.copy_for_child_in(&target, true),
                None => Ok(None),
            }
        })?;
        copy.map(|c| self.adopt_in(store, c)).transpose()
    }

    /// Members of the to-many `name` of the object `id`, as the parent sees
    /// them.
    pub(crate) fn child_to_many_in(
        &self,
        store: &mut ObjectStore,
        parent: &Arc<ContextInner>,
        id: &ObjectId,
        name: &str,
    ) -> Result<Vec<ObjectRef>> {
        let copies = parent.with_store(|ps| -> Result<Vec<ParentCopy>> {
            let Some(object) = parent.parent_object_in(ps, id)? else {
                return Ok(Vec::new());
            };
            match parent.resolve_hollow_in(&object) {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
            let mut copies = Vec::new();
            for member in parent.resolve_to_many_in(ps, &object, name)? {
                if let Some(copy) = parent.copy_for_child_in(&member, false)? {
                    copies.push(copy);
                }
            }
            Ok(copies)
        })?;
        let members = copies
            .into_iter()
            .map(|c| self.adopt_in(store, c))
            .collect::<Result<Vec<_>>>()?;
        Ok(unique(&members))
    }

    // ========================================================================
    // Committing into the parent
    // ========================================================================

    /// Replay the pending changes of `store` on `parent`'s objects, then
    /// mark them committed here.
    ///
    /// Attributes, to-one relationships and link-table changes are copied;
    /// to-many lists follow from their reverse to-ones. Deletes are applied
    /// last, with the parent's delete rules.
    pub(crate) fn commit_to_parent_in(&self, store: &mut ObjectStore, parent: &Arc<ContextInner>) -> Result<()> {
        let pending = Self::collect_pending(store);
        if pending.is_empty() && store.flattened().is_empty() {
            return Ok(());
        }
        let child: &ObjectStore = store;
        parent.with_store(|ps| parent.absorb_child_changes_in(ps, child, &pending))?;

        let mut deleted = Vec::new();
        for p in &pending {
            let mut data = p.object.write();
            match p.state {
                PersistenceState::New | PersistenceState::Modified => data.state = PersistenceState::Committed,
                PersistenceState::Deleted => deleted.push(Arc::clone(&p.object)),
                _ => {}
            }
            for slot in data.to_many.values_mut() {
                if let ToManySlot::Fault { added, removed } = slot {
                    added.clear();
                    removed.clear();
                }
            }
        }
        store.clear_changes();
        store.unregister_nodes(&deleted);
        tracing::debug!(objects = pending.len(), deleted = deleted.len(), "Committed changes to parent context");
        Ok(())
    }

    /// Parent side of [`commit_to_parent_in`](Self::commit_to_parent_in).
    /// Callers hold this context's store as `store` and the child's as
    /// `child`.
    fn absorb_child_changes_in(&self, store: &mut ObjectStore, child: &ObjectStore, pending: &[Pending]) -> Result<()> {
        let mut mapped: Vec<ObjectRef> = Vec::with_capacity(pending.len());
        for p in pending {
            let object = match p.state {
                PersistenceState::New => match store.get_node(&p.id) {
                    Some(existing) => existing,
                    None => self.insert_new_object_as(store, p.id.clone(), Arc::clone(&p.entity)),
                },
                _ => self
                    .parent_object_in(store, &p.id)?
                    .ok_or_else(|| Error::state(Some(p.id.clone()), "object no longer exists in the parent context"))?,
            };
            mapped.push(object);
        }

        for (p, object) in pending.iter().zip(&mapped) {
            let values: Vec<(String, Value)> = {
                let data = p.object.read();
                match p.state {
                    // unset attributes of a NEW object are NULL on both sides
                    PersistenceState::New => data
                        .values
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(n, v)| (n.clone(), v.clone()))
                        .collect(),
                    PersistenceState::Modified => p
                        .modified_attributes
                        .iter()
                        .map(|n| (n.clone(), data.values.get(n).cloned().unwrap_or_default()))
                        .collect(),
                    _ => Vec::new(),
                }
            };
            for (name, value) in values {
                self.set_attribute_in(store, object, &name, value)?;
            }
        }

        for (p, object) in pending.iter().zip(&mapped) {
            if p.state == PersistenceState::Deleted {
                continue;
            }
            let names: Vec<String> = match p.state {
                PersistenceState::New => p
                    .entity
                    .relationships
                    .iter()
                    .filter(|r| !r.is_to_many())
                    .map(|r| r.name.clone())
                    .collect(),
                _ => p.modified_to_one.iter().cloned().collect(),
            };
            for name in &names {
                let target = match p.object.read().to_one.get(name) {
                    Some(ToOneSlot::Resolved(target)) => target.clone(),
                    _ => continue,
                };
                let target = match target {
                    Some(t) => Some(self.parent_node_for(store, &t)?),
                    None => None,
                };
                let rel = self.relationship(&p.entity, name)?;
                self.set_to_one_in(store, object, &rel, target, true)?;
            }
        }

        for arc in child.flattened() {
            let skip = [&arc.source, &arc.target]
                .iter()
                .any(|o| matches!(o.read().state, PersistenceState::Deleted | PersistenceState::Transient));
            if skip {
                continue;
            }
            let source = self.parent_node_for(store, &arc.source)?;
            let target = self.parent_node_for(store, &arc.target)?;
            let rel = self.relationship(&source.entity(), &arc.relationship)?;
            if arc.added {
                self.add_to_many_in(store, &source, &rel, &target, true)?;
            } else {
                self.remove_from_many_in(store, &source, &rel, &target, true)?;
            }
        }

        for (p, object) in pending.iter().zip(&mapped) {
            if p.state == PersistenceState::Deleted {
                self.delete_in(store, object)?;
            }
        }
        Ok(())
    }

    /// This context's object for a child's `object`.
    fn parent_node_for(&self, store: &mut ObjectStore, object: &ObjectRef) -> Result<ObjectRef> {
        let id = object
            .object_id()
            .ok_or_else(|| Error::state(None, "related object is not registered in the child context"))?;
        self.parent_object_in(store, &id)?
            .ok_or_else(|| Error::state(Some(id), "related object does not exist in the parent context"))
    }

    /// Registered objects still under a temporary id.
    pub(crate) fn temporary_nodes(store: &ObjectStore) -> Vec<(ObjectRef, ObjectId)> {
        store
            .registered_objects()
            .filter_map(|o| {
                let id = o.object_id()?;
                id.is_temporary().then(|| (Arc::clone(o), id))
            })
            .collect()
    }

    /// Move child objects to the permanent ids their parent copies got in
    /// a commit.
    pub(crate) fn adopt_permanent_ids(store: &mut ObjectStore, pairs: &[(ObjectRef, ObjectId, ObjectRef)]) {
        for (child, temporary, parent_node) in pairs {
            let Some(permanent) = parent_node.object_id().filter(|id| !id.is_temporary()) else {
                continue;
            };
            store.rekey(temporary, permanent.clone());
            let mut data = child.write();
            let entity = Arc::clone(&data.entity);
            for attr in entity.pk_attributes() {
                if let Some(value) = permanent.key_value(&attr.column) {
                    data.values.insert(attr.name.clone(), value.clone());
                }
            }
            data.id = Some(permanent);
        }
    }
}
