//! Fault resolution for HOLLOW objects and unfetched relationships.

use std::cmp::Ordering;
use std::sync::Arc;

use rowgraph_core::{
    DataRow, EntityInfo, Error, ObjectId, QueryError, QueryErrorKind, Qualifier, RelationshipInfo, Result,
    RowQuery, Value,
};

use crate::context::ContextInner;
use crate::object::{self, ObjectRef, PersistenceState, PersistentObject, ToManySlot, ToOneSlot, is_live};
use crate::object_store::ObjectStore;
use crate::query::unique;

/// Fetched members with pending local additions and removals replayed.
pub(crate) fn merge_members(fetched: Vec<ObjectRef>, added: &[ObjectRef], removed: &[ObjectRef]) -> Vec<ObjectRef> {
    let mut members: Vec<ObjectRef> = fetched
        .into_iter()
        .filter(|o| is_live(o) && !object::contains(removed, o))
        .collect();
    for object in added {
        if is_live(object) && !object::contains(&members, object) {
            members.push(Arc::clone(object));
        }
    }
    members
}

/// Stable sort by an attribute value, NULLs first.
pub(crate) fn sort_members(members: &mut Vec<ObjectRef>, attribute: &str) {
    let mut keyed: Vec<(Value, ObjectRef)> = members
        .drain(..)
        .map(|o| {
            let key = o.read().values.get(attribute).cloned().unwrap_or_default();
            (key, o)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.compare(&b.0).unwrap_or(Ordering::Equal));
    members.extend(keyed.into_iter().map(|(_, o)| o));
}

impl ContextInner {
    pub(crate) fn resolve_hollow(&self, object: &PersistentObject) -> Result<()> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            self.resolve_hollow_in(&object)
        })
    }

    /// Fill a HOLLOW object from its committed row. Callers hold the store.
    pub(crate) fn resolve_hollow_in(&self, object: &ObjectRef) -> Result<()> {
        let (id, entity) = {
            let data = object.read();
            if data.state != PersistenceState::Hollow {
                return Ok(());
            }
            (data.id()?.clone(), Arc::clone(&data.entity))
        };
        let Some(row) = self.committed_row(&entity, &id)? else {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::NotFound,
                message: format!("row of {} no longer exists", id),
                table: Some(entity.table.clone()),
                source: None,
            }));
        };
        self.fill_from_row(object, &row, row.version());
        tracing::trace!(id = %id, "Resolved hollow object");
        Ok(())
    }

    pub(crate) fn resolve_to_one(&self, object: &PersistentObject, name: &str) -> Result<Option<ObjectRef>> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            self.resolve_to_one_in(store, &object, name)
        })
    }

    /// Current target of a to-one relationship, fetching it if faulted.
    ///
    /// A foreign key pointing at a vanished row resolves to `None`.
    pub(crate) fn resolve_to_one_in(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        name: &str,
    ) -> Result<Option<ObjectRef>> {
        let (id, entity) = {
            let data = object.read();
            match data.to_one.get(name) {
                Some(ToOneSlot::Resolved(target)) => return Ok(target.clone()),
                Some(ToOneSlot::Fault) => {}
                None => return Err(Error::unknown_property(&data.entity.name, name)),
            }
            (data.id()?.clone(), Arc::clone(&data.entity))
        };
        let rel = self.relationship(&entity, name)?;
        let target = match self.fetch_to_one(store, &entity, &id, &rel) {
            Ok(target) => target,
            Err(Error::StaleFault { owner, relationship }) => {
                tracing::debug!(owner = %owner, relationship = %relationship, "Relationship points at a missing row");
                None
            }
            Err(e) => return Err(e),
        };

        let mut data = object.write();
        if matches!(data.to_one.get(name), Some(ToOneSlot::Fault)) {
            data.to_one
                .insert(name.to_string(), ToOneSlot::Resolved(target.clone()));
        }
        Ok(target)
    }

    fn fetch_to_one(
        &self,
        store: &mut ObjectStore,
        entity: &EntityInfo,
        id: &ObjectId,
        rel: &RelationshipInfo,
    ) -> Result<Option<ObjectRef>> {
        let stale = || Error::StaleFault {
            owner: id.clone(),
            relationship: rel.name.clone(),
        };
        if let Some(parent) = &self.parent {
            return self.child_to_one_in(store, parent, id, &rel.name);
        }
        if id.is_temporary() {
            return Ok(None);
        }
        if rel.owns_foreign_key {
            let row = self.committed_row(entity, id)?.ok_or_else(stale)?;
            let Some(target_id) = self.fk_target_id(rel, &row) else {
                return Ok(None);
            };
            return self
                .object_for_id_in(store, &target_id)?
                .map(Some)
                .ok_or_else(stale);
        }

        let target = self.entity(&rel.target_entity)?;
        let rows = self.related_rows(entity, id, rel, &target)?;
        if rows.len() > 1 {
            return Err(Error::query(
                QueryErrorKind::TooManyRows,
                format!("to-one '{}' of {} matched {} rows", rel.name, id, rows.len()),
            ));
        }
        Ok(self
            .objects_from_rows(store, &target, &rows, false)?
            .into_iter()
            .next())
    }

    /// Rows of `target` related to the source object `id` through `rel`.
    fn related_rows(
        &self,
        source: &EntityInfo,
        id: &ObjectId,
        rel: &RelationshipInfo,
        target: &EntityInfo,
    ) -> Result<Vec<DataRow>> {
        let qualifier = Qualifier::Related {
            path: rel.reversed_path(&source.table),
            anchor: Box::new(Qualifier::matching(id.key_values())),
            echo: Vec::new(),
        }
        .and(self.resolver.entity_qualifier(&target.name));
        let rows = self
            .executor
            .select(&RowQuery::new(target.table.clone(), qualifier))?;
        Ok(rows.iter().map(DataRow::root_columns).collect())
    }

    pub(crate) fn resolve_to_many(&self, object: &PersistentObject, name: &str) -> Result<Vec<ObjectRef>> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            self.resolve_to_many_in(store, &object, name)
        })
    }

    /// Members of a to-many relationship, fetching them if faulted.
    ///
    /// Objects added or removed while the list was a fault are replayed on
    /// the fetched members; DELETED members are left out.
    pub(crate) fn resolve_to_many_in(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        name: &str,
    ) -> Result<Vec<ObjectRef>> {
        let (id, entity, added, removed) = {
            let data = object.read();
            match data.to_many.get(name) {
                Some(ToManySlot::Resolved(list)) => return Ok(list.clone()),
                Some(ToManySlot::Fault { added, removed }) => (
                    data.id()?.clone(),
                    Arc::clone(&data.entity),
                    added.clone(),
                    removed.clone(),
                ),
                None => return Err(Error::unknown_property(&data.entity.name, name)),
            }
        };
        let rel = self.relationship(&entity, name)?;
        let fetched = if let Some(parent) = &self.parent {
            self.child_to_many_in(store, parent, &id, name)?
        } else if id.is_temporary() {
            Vec::new()
        } else {
            let target = self.entity(&rel.target_entity)?;
            let rows = self.related_rows(&entity, &id, &rel, &target)?;
            unique(&self.objects_from_rows(store, &target, &rows, false)?)
        };
        let mut members = merge_members(fetched, &added, &removed);
        if let Some(attribute) = &rel.order_by {
            sort_members(&mut members, attribute);
        }
        tracing::trace!(id = %id, relationship = name, members = members.len(), "Resolved to-many fault");

        let mut data = object.write();
        if let Some(slot @ ToManySlot::Fault { .. }) = data.to_many.get_mut(name) {
            *slot = ToManySlot::Resolved(members.clone());
        }
        Ok(members)
    }
}
