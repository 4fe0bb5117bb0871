//! Merging newer snapshots into registered objects, both for refreshing
//! queries and for changes committed by other contexts.
//!
//! Local edits always win: attributes and to-one relationships changed in
//! this context keep their values, everything else adopts the snapshot.
//! Applying an event never queries the database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rowgraph_cache::SnapshotEvent;
use rowgraph_core::{DataRow, EntityInfo, ObjectId, RelationshipInfo};

use crate::context::ContextInner;
use crate::diff::GraphDiff;
use crate::object::{ObjectRef, PersistenceState, ToManySlot, ToOneSlot};
use crate::object_store::ObjectStore;
use crate::query::values_from_row;

impl ContextInner {
    /// Id of the object the foreign key of `rel` in `row` points at; `None`
    /// when any key column is NULL.
    pub(crate) fn fk_target_id(&self, rel: &RelationshipInfo, row: &DataRow) -> Option<ObjectId> {
        let step = rel.first_step()?;
        let mut key = BTreeMap::new();
        for pair in &step.pairs {
            let value = row.get(&pair.source).filter(|v| !v.is_null())?;
            key.insert(pair.target.clone(), value.clone());
        }
        Some(ObjectId::new(rel.target_entity.clone(), key))
    }

    fn points_to(&self, target: Option<&ObjectRef>, expected: Option<&ObjectId>) -> bool {
        match (target, expected) {
            (None, None) => true,
            (Some(target), Some(expected)) => target.object_id().is_some_and(|id| {
                id.key_values() == expected.key_values()
                    && self.resolver.is_kind_of(id.entity_name(), expected.entity_name())
            }),
            _ => false,
        }
    }

    /// Resolved foreign-key to-ones of `object` that `row` no longer agrees
    /// with. Names in `keep` and unsaved targets are never reported.
    fn stale_to_ones(&self, object: &ObjectRef, row: &DataRow, keep: &BTreeSet<String>) -> Vec<String> {
        let (entity, resolved): (Arc<EntityInfo>, Vec<(String, Option<ObjectRef>)>) = {
            let data = object.read();
            let resolved = data
                .to_one
                .iter()
                .filter_map(|(name, slot)| match slot {
                    ToOneSlot::Resolved(target) if !keep.contains(name) => Some((name.clone(), target.clone())),
                    _ => None,
                })
                .collect();
            (Arc::clone(&data.entity), resolved)
        };
        resolved
            .into_iter()
            .filter(|(name, target)| {
                let Some(rel) = entity.relationship_info(name) else {
                    return false;
                };
                if !rel.owns_foreign_key {
                    return false;
                }
                if target
                    .as_ref()
                    .is_some_and(|t| t.read().state == PersistenceState::New)
                {
                    return false;
                }
                !self.points_to(target.as_ref(), self.fk_target_id(rel, row).as_ref())
            })
            .map(|(name, _)| name)
            .collect()
    }

    /// Overwrite a COMMITTED object with a newer snapshot.
    pub(crate) fn refresh_committed(&self, object: &ObjectRef, row: &DataRow, version: u64) {
        let stale = self.stale_to_ones(object, row, &BTreeSet::new());
        let mut data = object.write();
        let values = values_from_row(&data.entity, row);
        data.values = values;
        for name in stale {
            data.to_one.insert(name, ToOneSlot::Fault);
        }
        data.snapshot_version = Some(version);
    }

    /// Merge a newer snapshot into a MODIFIED or DELETED object.
    ///
    /// Locally modified attributes and to-ones are kept. With `rebase` the
    /// snapshot also becomes the baseline the remaining changes are locked
    /// against; otherwise the old baseline stays, so a conflicting commit
    /// still fails its lock check.
    pub(crate) fn merge_row(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        row: &DataRow,
        version: u64,
        rebase: bool,
    ) {
        let Some(id) = object.object_id() else {
            return;
        };
        let (kept_attributes, kept_to_one) = match store.diff(&id) {
            Some(diff) => {
                let data = object.read();
                let attributes: BTreeSet<String> = diff
                    .modified_attributes
                    .iter()
                    .filter(|p| diff.is_attribute_modified(&data, p))
                    .cloned()
                    .collect();
                (attributes, diff.modified_to_one.clone())
            }
            None => (BTreeSet::new(), BTreeSet::new()),
        };
        let stale = self.stale_to_ones(object, row, &kept_to_one);
        {
            let mut data = object.write();
            let entity = Arc::clone(&data.entity);
            for attr in &entity.attributes {
                if kept_attributes.contains(&attr.name) {
                    continue;
                }
                data.values.insert(
                    attr.name.clone(),
                    row.get(&attr.column).cloned().unwrap_or_default(),
                );
            }
            for name in stale {
                data.to_one.insert(name, ToOneSlot::Fault);
            }
            data.snapshot_version = Some(version);
        }
        if let Some(diff) = store.diff_mut(&id) {
            diff.modified_attributes
                .retain(|p| kept_attributes.contains(p));
            if rebase {
                diff.baseline = Some(Arc::new(row.clone()));
            }
        }
        tracing::trace!(id = %id, kept = kept_attributes.len(), rebase, "Merged snapshot into changed object");
    }

    /// Bring registered objects in line with changes posted by another
    /// context.
    pub(crate) fn apply_snapshot_event(&self, store: &mut ObjectStore, event: &SnapshotEvent) {
        for id in event.modified.keys() {
            let Some(object) = store.get_node(id) else {
                continue;
            };
            let state = object.read().state;
            match state {
                PersistenceState::Committed => match self.snapshots.peek(id) {
                    Some(row) => self.refresh_committed(&object, &row, row.version()),
                    None => object.write().make_hollow(),
                },
                PersistenceState::Modified | PersistenceState::Deleted => {
                    if let Some(row) = self.snapshots.peek(id) {
                        self.merge_row(store, &object, &row, row.version(), false);
                    }
                }
                _ => {}
            }
        }

        for id in &event.deleted {
            let Some(object) = store.get_node(id) else {
                continue;
            };
            let state = object.read().state;
            match state {
                PersistenceState::Committed | PersistenceState::Hollow | PersistenceState::Deleted => {
                    store.unregister_nodes(std::slice::from_ref(&object));
                }
                PersistenceState::Modified => {
                    // local edits survive as a row to insert again
                    object.write().state = PersistenceState::New;
                    store.register_diff(id, GraphDiff::NodeCreated(id.clone()));
                }
                _ => {}
            }
        }

        for id in &event.invalidated {
            let Some(object) = store.get_node(id) else {
                continue;
            };
            let state = object.read().state;
            match state {
                PersistenceState::Committed => object.write().make_hollow(),
                PersistenceState::Modified => {
                    if let Some(row) = self.snapshots.peek(id) {
                        self.merge_row(store, &object, &row, row.version(), false);
                    }
                }
                _ => {}
            }
        }

        for id in &event.indirectly_modified {
            let Some(object) = store.find_registered(&self.resolver, id) else {
                continue;
            };
            let Some(object_id) = object.object_id() else {
                continue;
            };
            let (touched, kept_to_one) = store
                .diff(&object_id)
                .map(|d| (d.touched_to_many.clone(), d.modified_to_one.clone()))
                .unwrap_or_default();
            let mut data = object.write();
            if !matches!(
                data.state,
                PersistenceState::Committed | PersistenceState::Modified | PersistenceState::Deleted
            ) {
                continue;
            }
            let entity = Arc::clone(&data.entity);
            for rel in &entity.relationships {
                if rel.is_to_many() {
                    if !touched.contains(&rel.name) {
                        data.to_many.insert(rel.name.clone(), ToManySlot::fault());
                    }
                } else if !rel.owns_foreign_key && !kept_to_one.contains(&rel.name) {
                    data.to_one.insert(rel.name.clone(), ToOneSlot::Fault);
                }
            }
        }

        tracing::trace!(
            source = ?event.source,
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            "Applied snapshot event"
        );
    }
}
