//! Local graph changes: attribute writes, relationship edits, deletes and
//! their reversal.
//!
//! Every function here runs with the context's store locked. Object locks are
//! taken one at a time and never held across a call that may lock another
//! object.

use std::sync::Arc;

use rowgraph_cache::SnapshotChanges;
use rowgraph_core::{DataRow, DeleteRule, Error, ObjectId, RelationshipInfo, Result, Value};

use crate::context::ContextInner;
use crate::diff::{FlattenedArc, GraphDiff};
use crate::lifecycle::LifecycleEvent;
use crate::object::{self, ObjectRef, PersistenceState, PersistentObject, ToManySlot, ToOneSlot, is_live};
use crate::object_store::ObjectStore;

fn same_target(a: Option<&ObjectRef>, b: Option<&ObjectRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => object::same(a, b),
        _ => false,
    }
}

impl ContextInner {
    /// The registered handle of `object`, which must live in this context.
    pub(crate) fn registered(&self, store: &ObjectStore, object: &PersistentObject) -> Result<ObjectRef> {
        let id = object
            .object_id()
            .ok_or_else(|| Error::state(None, "object is not registered in any context"))?;
        match store.get_node(&id) {
            Some(node) if object::same(&node, object) => Ok(node),
            _ => Err(Error::state(Some(id), "object is not registered in this context")),
        }
    }

    fn reverse_of(&self, object: &ObjectRef, rel: &RelationshipInfo) -> Option<RelationshipInfo> {
        let entity = object.entity();
        self.resolver
            .reverse_relationship(&entity.name, &rel.name)
            .cloned()
    }

    /// Row holding the key and attribute columns of `object`'s current values.
    fn row_from_object(&self, object: &ObjectRef) -> DataRow {
        let data = object.read();
        let mut row = DataRow::new();
        if let Some(id) = &data.id {
            for (column, value) in id.key_values() {
                row.insert(column.clone(), value.clone());
            }
        }
        for attr in &data.entity.attributes {
            if let Some(value) = data.values.get(&attr.name) {
                row.insert(attr.column.clone(), value.clone());
            }
        }
        row
    }

    /// Prepare `object` for a local change.
    ///
    /// A HOLLOW object is resolved first. A COMMITTED one is brought up to
    /// date with its current snapshot, which becomes the baseline its changes
    /// are diffed and locked against, and turns MODIFIED.
    pub(crate) fn will_modify(&self, store: &mut ObjectStore, object: &ObjectRef) -> Result<ObjectId> {
        let (id, state) = {
            let data = object.read();
            (data.id.clone(), data.state)
        };
        let Some(id) = id else {
            return Err(Error::state(None, "cannot track changes of a transient object"));
        };
        match state {
            PersistenceState::Transient => {
                return Err(Error::state(Some(id), "cannot track changes of a transient object"));
            }
            PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted => {
                store.ensure_diff(&id, object, None);
                return Ok(id);
            }
            PersistenceState::Hollow => self.resolve_hollow_in(object)?,
            PersistenceState::Committed => {}
        }

        let (entity, version) = {
            let data = object.read();
            (Arc::clone(&data.entity), data.snapshot_version)
        };
        let baseline = match self.committed_row(&entity, &id)? {
            Some(row) => {
                if version != Some(row.version()) {
                    self.refresh_committed(object, &row, row.version());
                }
                row
            }
            None => Arc::new(self.row_from_object(object)),
        };
        object.write().state = PersistenceState::Modified;
        store.ensure_diff(&id, object, Some(baseline));
        Ok(id)
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub(crate) fn set_attribute(&self, object: &PersistentObject, name: &str, value: Value) -> Result<()> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            self.set_attribute_in(store, &object, name, value)
        })
    }

    pub(crate) fn set_attribute_in(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let (entity, state, id) = {
            let data = object.read();
            (Arc::clone(&data.entity), data.state, data.id.clone())
        };
        if entity.attribute_info(name).is_none() {
            return Err(Error::unknown_property(&entity.name, name));
        }
        if state == PersistenceState::Deleted {
            return Err(Error::state(id, "cannot modify a deleted object"));
        }
        if state == PersistenceState::Hollow {
            self.resolve_hollow_in(object)?;
        }
        if object.read().values.get(name) == Some(&value) {
            return Ok(());
        }

        let id = self.will_modify(store, object)?;
        let old = {
            let mut data = object.write();
            data.values
                .insert(name.to_string(), value.clone())
                .unwrap_or_default()
        };
        if let Some(diff) = store.diff_mut(&id) {
            diff.modified_attributes.insert(name.to_string());
        }
        store.register_diff(
            &id,
            GraphDiff::AttributeChanged {
                id: id.clone(),
                property: name.to_string(),
                old,
                new: value,
            },
        );
        Ok(())
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Check that `target` can be related to an object of this context.
    fn check_target(&self, rel: &RelationshipInfo, target: &ObjectRef) -> Result<()> {
        if !target.belongs_to(&self.weak()) {
            return Err(Error::state(
                target.object_id(),
                "target object is registered in another context",
            ));
        }
        let data = target.read();
        if matches!(data.state, PersistenceState::Transient | PersistenceState::Deleted) {
            return Err(Error::state(
                data.id.clone(),
                format!("cannot relate to a {} object", data.state),
            ));
        }
        if !self.resolver.is_kind_of(&data.entity.name, &rel.target_entity) {
            return Err(Error::metadata(
                Some(&data.entity.name),
                format!(
                    "'{}' cannot be the target of '{}', which expects {}",
                    data.entity.name, rel.name, rel.target_entity
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn set_to_one(
        &self,
        object: &PersistentObject,
        name: &str,
        target: Option<&ObjectRef>,
    ) -> Result<()> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            let rel = self.relationship(&object.entity(), name)?;
            if rel.is_to_many() {
                return Err(Error::metadata(
                    Some(&object.entity_name()),
                    format!("'{}' is a to-many relationship", name),
                ));
            }
            if let Some(target) = target {
                self.check_target(&rel, target)?;
            }
            self.set_to_one_in(store, &object, &rel, target.cloned(), true)
        })
    }

    pub(crate) fn add_to_many(&self, object: &PersistentObject, name: &str, target: &ObjectRef) -> Result<()> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            let rel = self.to_many_relationship(&object, name)?;
            self.check_target(&rel, target)?;
            self.add_to_many_in(store, &object, &rel, target, true)
        })
    }

    pub(crate) fn remove_from_many(&self, object: &PersistentObject, name: &str, target: &ObjectRef) -> Result<()> {
        self.with_store(|store| {
            let object = self.registered(store, object)?;
            let rel = self.to_many_relationship(&object, name)?;
            if !target.belongs_to(&self.weak()) {
                return Err(Error::state(
                    target.object_id(),
                    "target object is registered in another context",
                ));
            }
            self.remove_from_many_in(store, &object, &rel, target, true)
        })
    }

    fn to_many_relationship(&self, object: &ObjectRef, name: &str) -> Result<RelationshipInfo> {
        let rel = self.relationship(&object.entity(), name)?;
        if !rel.is_to_many() {
            return Err(Error::metadata(
                Some(&object.entity_name()),
                format!("'{}' is a to-one relationship", name),
            ));
        }
        Ok(rel)
    }

    /// Point `rel` of `object` at `target`.
    ///
    /// With `propagate`, the reverse relationship of the old and the new
    /// target is updated too; the recursive calls run without it.
    pub(crate) fn set_to_one_in(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        rel: &RelationshipInfo,
        target: Option<ObjectRef>,
        propagate: bool,
    ) -> Result<()> {
        let old = self.resolve_to_one_in(store, object, &rel.name)?;
        if same_target(old.as_ref(), target.as_ref()) {
            return Ok(());
        }

        let id = self.will_modify(store, object)?;
        object
            .write()
            .to_one
            .insert(rel.name.clone(), ToOneSlot::Resolved(target.clone()));
        if let Some(diff) = store.diff_mut(&id) {
            diff.modified_to_one.insert(rel.name.clone());
        }
        if let Some(old_id) = old.as_ref().and_then(|o| o.object_id()) {
            store.register_diff(
                &id,
                GraphDiff::ArcDeleted {
                    id: id.clone(),
                    relationship: rel.name.clone(),
                    target: old_id,
                },
            );
        }
        if let Some(new_id) = target.as_ref().and_then(|t| t.object_id()) {
            store.register_diff(
                &id,
                GraphDiff::ArcCreated {
                    id: id.clone(),
                    relationship: rel.name.clone(),
                    target: new_id,
                },
            );
        }
        if rel.is_flattened() && propagate {
            for (other, added) in [(&old, false), (&target, true)] {
                if let Some(other) = other {
                    store.record_flattened(FlattenedArc {
                        source: Arc::clone(object),
                        relationship: rel.name.clone(),
                        reverse: rel.reverse.clone(),
                        target: Arc::clone(other),
                        added,
                    });
                }
            }
        }

        if !(propagate && self.config.validate_arc_consistency) {
            return Ok(());
        }
        let Some(reverse) = self.reverse_of(object, rel) else {
            return Ok(());
        };
        if let Some(old) = old.filter(|o| is_live(o)) {
            if reverse.is_to_many() {
                self.remove_from_many_in(store, &old, &reverse, object, false)?;
            } else {
                self.set_to_one_in(store, &old, &reverse, None, false)?;
            }
        }
        if let Some(new) = target.filter(|t| is_live(t)) {
            if reverse.is_to_many() {
                self.add_to_many_in(store, &new, &reverse, object, false)?;
            } else {
                // one-to-one: the target's previous partner loses it
                let previous = self.resolve_to_one_in(store, &new, &reverse.name)?;
                if let Some(previous) = previous.filter(|p| !object::same(p, object) && is_live(p)) {
                    self.set_to_one_in(store, &previous, rel, None, false)?;
                }
                self.set_to_one_in(store, &new, &reverse, Some(Arc::clone(object)), false)?;
            }
        }
        Ok(())
    }

    pub(crate) fn add_to_many_in(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        rel: &RelationshipInfo,
        target: &ObjectRef,
        propagate: bool,
    ) -> Result<()> {
        {
            let data = object.read();
            match data.to_many.get(&rel.name) {
                Some(ToManySlot::Resolved(list)) if object::contains(list, target) => return Ok(()),
                Some(ToManySlot::Fault { added, .. }) if object::contains(added, target) => return Ok(()),
                Some(_) => {}
                None => return Err(Error::unknown_property(&data.entity.name, &rel.name)),
            }
        }

        let id = self.will_modify(store, object)?;
        {
            let mut data = object.write();
            match data.to_many.get_mut(&rel.name) {
                Some(ToManySlot::Resolved(list)) => list.push(Arc::clone(target)),
                Some(ToManySlot::Fault { added, removed }) => {
                    if !object::remove(removed, target) {
                        added.push(Arc::clone(target));
                    }
                }
                None => {}
            }
        }
        if let Some(diff) = store.diff_mut(&id) {
            diff.touched_to_many.insert(rel.name.clone());
        }
        if let Some(target_id) = target.object_id() {
            store.register_diff(
                &id,
                GraphDiff::ArcCreated {
                    id: id.clone(),
                    relationship: rel.name.clone(),
                    target: target_id,
                },
            );
        }
        if rel.is_flattened() && propagate {
            store.record_flattened(FlattenedArc {
                source: Arc::clone(object),
                relationship: rel.name.clone(),
                reverse: rel.reverse.clone(),
                target: Arc::clone(target),
                added: true,
            });
        }

        if !(propagate && self.config.validate_arc_consistency) || !is_live(target) {
            return Ok(());
        }
        let Some(reverse) = self.reverse_of(object, rel) else {
            return Ok(());
        };
        if reverse.is_to_many() {
            return self.add_to_many_in(store, target, &reverse, object, false);
        }
        // the target leaves its previous owner's list
        let previous = self.resolve_to_one_in(store, target, &reverse.name)?;
        if let Some(previous) = previous.filter(|p| !object::same(p, object) && is_live(p)) {
            self.remove_from_many_in(store, &previous, rel, target, false)?;
        }
        self.set_to_one_in(store, target, &reverse, Some(Arc::clone(object)), false)
    }

    pub(crate) fn remove_from_many_in(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        rel: &RelationshipInfo,
        target: &ObjectRef,
        propagate: bool,
    ) -> Result<()> {
        {
            let data = object.read();
            match data.to_many.get(&rel.name) {
                Some(ToManySlot::Resolved(list)) if !object::contains(list, target) => return Ok(()),
                Some(ToManySlot::Fault { removed, .. }) if object::contains(removed, target) => return Ok(()),
                Some(_) => {}
                None => return Err(Error::unknown_property(&data.entity.name, &rel.name)),
            }
        }

        let id = self.will_modify(store, object)?;
        {
            let mut data = object.write();
            match data.to_many.get_mut(&rel.name) {
                Some(ToManySlot::Resolved(list)) => {
                    object::remove(list, target);
                }
                Some(ToManySlot::Fault { added, removed }) => {
                    if !object::remove(added, target) {
                        removed.push(Arc::clone(target));
                    }
                }
                None => {}
            }
        }
        if let Some(diff) = store.diff_mut(&id) {
            diff.touched_to_many.insert(rel.name.clone());
        }
        if let Some(target_id) = target.object_id() {
            store.register_diff(
                &id,
                GraphDiff::ArcDeleted {
                    id: id.clone(),
                    relationship: rel.name.clone(),
                    target: target_id,
                },
            );
        }
        if rel.is_flattened() && propagate {
            store.record_flattened(FlattenedArc {
                source: Arc::clone(object),
                relationship: rel.name.clone(),
                reverse: rel.reverse.clone(),
                target: Arc::clone(target),
                added: false,
            });
        }

        if !(propagate && self.config.validate_arc_consistency) || !is_live(target) {
            return Ok(());
        }
        let Some(reverse) = self.reverse_of(object, rel) else {
            return Ok(());
        };
        if reverse.is_to_many() {
            return self.remove_from_many_in(store, target, &reverse, object, false);
        }
        let current = self.resolve_to_one_in(store, target, &reverse.name)?;
        if current.is_some_and(|c| object::same(&c, object)) {
            self.set_to_one_in(store, target, &reverse, None, false)?;
        }
        Ok(())
    }

    /// Live objects `rel` of `object` points at.
    fn related_objects(
        &self,
        store: &mut ObjectStore,
        object: &ObjectRef,
        rel: &RelationshipInfo,
    ) -> Result<Vec<ObjectRef>> {
        let targets = if rel.is_to_many() {
            self.resolve_to_many_in(store, object, &rel.name)?
        } else {
            self.resolve_to_one_in(store, object, &rel.name)?
                .into_iter()
                .collect()
        };
        Ok(targets.into_iter().filter(|t| is_live(t)).collect())
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    /// Mark `object` DELETED and apply the delete rules of its relationships.
    ///
    /// DENY rules are checked before anything changes. A NEW object is
    /// unregistered instead of being scheduled for a DELETE.
    pub(crate) fn delete_in(&self, store: &mut ObjectStore, object: &ObjectRef) -> Result<()> {
        let (id, state, entity) = {
            let data = object.read();
            (data.id.clone(), data.state, Arc::clone(&data.entity))
        };
        let Some(id) = id else {
            return Err(Error::state(None, "cannot delete a transient object"));
        };
        match state {
            PersistenceState::Transient => {
                return Err(Error::state(Some(id), "cannot delete a transient object"));
            }
            PersistenceState::Deleted => return Ok(()),
            _ => {}
        }
        if !object.belongs_to(&self.weak()) {
            return Err(Error::state(Some(id), "object is registered in another context"));
        }

        for rel in entity.relationships.iter().filter(|r| r.delete_rule == DeleteRule::Deny) {
            let targets = self.related_objects(store, object, rel)?;
            if !targets.is_empty() {
                return Err(Error::state(
                    Some(id),
                    format!(
                        "cannot delete: relationship '{}' still has {} related object(s)",
                        rel.name,
                        targets.len()
                    ),
                ));
            }
        }

        self.will_modify(store, object)?;
        object.write().state = PersistenceState::Deleted;
        store.register_diff(&id, GraphDiff::NodeDeleted(id.clone()));
        self.queue_callback(LifecycleEvent::PreRemove, object);

        for rel in &entity.relationships {
            let targets = self.related_objects(store, object, rel)?;
            if targets.is_empty() {
                continue;
            }
            let reverse = self.reverse_of(object, rel);
            if rel.is_flattened() {
                for target in &targets {
                    store.record_flattened(FlattenedArc {
                        source: Arc::clone(object),
                        relationship: rel.name.clone(),
                        reverse: rel.reverse.clone(),
                        target: Arc::clone(target),
                        added: false,
                    });
                    if let Some(reverse) = reverse.as_ref().filter(|r| r.is_to_many()) {
                        self.remove_from_many_in(store, target, reverse, object, false)?;
                    }
                }
                if rel.delete_rule != DeleteRule::Cascade {
                    continue;
                }
            }
            match rel.delete_rule {
                DeleteRule::Cascade => {
                    for target in &targets {
                        self.delete_in(store, target)?;
                    }
                }
                DeleteRule::Nullify => {
                    let Some(reverse) = &reverse else { continue };
                    for target in &targets {
                        if reverse.is_to_many() {
                            self.remove_from_many_in(store, target, reverse, object, false)?;
                        } else {
                            self.set_to_one_in(store, target, reverse, None, false)?;
                        }
                    }
                }
                DeleteRule::NoAction | DeleteRule::Deny => {}
            }
        }

        if state == PersistenceState::New {
            store.unregister_nodes(std::slice::from_ref(object));
        }
        tracing::trace!(id = %id, "Marked object deleted");
        Ok(())
    }

    // ========================================================================
    // Rollback and invalidation
    // ========================================================================

    /// Forget NEW objects, turn changed ones HOLLOW and drop every diff.
    pub(crate) fn rollback_in(&self, store: &mut ObjectStore) {
        let changed: Vec<ObjectRef> = store
            .pending()
            .iter()
            .map(|d| Arc::clone(&d.object))
            .collect();
        let mut created = Vec::new();
        for object in &changed {
            let state = object.read().state;
            match state {
                PersistenceState::New => created.push(Arc::clone(object)),
                PersistenceState::Modified | PersistenceState::Deleted => object.write().make_hollow(),
                _ => {}
            }
        }
        store.unregister_nodes(&created);
        store.clear_changes();
        tracing::debug!(
            reverted = changed.len() - created.len(),
            discarded = created.len(),
            "Rolled back changes"
        );
    }

    /// Turn committed objects HOLLOW and evict their snapshots everywhere.
    pub(crate) fn invalidate_in(&self, store: &mut ObjectStore, objects: &[ObjectRef]) -> Result<()> {
        let mut ids = Vec::new();
        for object in objects {
            let (id, state) = {
                let data = object.read();
                (data.id.clone(), data.state)
            };
            let Some(id) = id else { continue };
            if state == PersistenceState::New || id.is_temporary() {
                continue;
            }
            if !object.belongs_to(&self.weak()) {
                return Err(Error::state(Some(id), "object is registered in another context"));
            }
            object.write().make_hollow();
            store.remove_diff(&id);
            store.forget_flattened(object);
            ids.push(id);
        }
        if ids.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = ids.len(), "Invalidated objects");
        self.snapshots.process_changes(
            self.subscriber(),
            SnapshotChanges {
                invalidated: ids,
                ..SnapshotChanges::default()
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gallery, seed_artists, seed_painting};
    use crate::ObjectSelect;
    use rowgraph_core::{OrderBy, Qualifier};

    #[test]
    fn test_write_marks_committed_object_modified() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);

        artist.write_property("name", "Claude Monet").unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Modified);
        assert!(context.has_changes());
        let changes = context.changes_by_object_id();
        let log = &changes[&artist.object_id().unwrap()];
        assert!(matches!(
            &log[0],
            GraphDiff::AttributeChanged { property, .. } if property == "name"
        ));
    }

    #[test]
    fn test_writing_the_same_value_is_a_no_op() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);

        artist.write_property("name", "Monet").unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
        assert!(!context.has_changes());
    }

    #[test]
    fn test_reverting_a_change_leaves_nothing_to_commit() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);

        artist.write_property("name", "Manet").unwrap();
        artist.write_property("name", "Monet").unwrap();
        assert!(!context.has_changes());
    }

    #[test]
    fn test_unknown_attribute_is_rejected() {
        let fixture = gallery();
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        let err = artist.write_property("nickname", "x").unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn test_set_to_one_updates_reverse_list() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet"), (2, "Manet")]);
        seed_painting(&fixture.db, 10, "Water Lilies", Some(1));
        let context = fixture.context();
        let artists = context
            .select(&ObjectSelect::query("Artist").order_by(OrderBy::asc("ARTIST_ID")))
            .unwrap();
        let painting = context.select(&ObjectSelect::query("Painting")).unwrap().remove(0);

        assert_eq!(artists[0].to_many("paintings").unwrap().len(), 1);
        painting.set_to_one("artist", Some(&artists[1])).unwrap();

        assert!(artists[0].to_many("paintings").unwrap().is_empty());
        let moved = artists[1].to_many("paintings").unwrap();
        assert_eq!(moved.len(), 1);
        assert!(Arc::ptr_eq(&moved[0], &painting));
        assert_eq!(artists[0].persistence_state(), PersistenceState::Modified);
    }

    #[test]
    fn test_add_to_many_sets_reverse_to_one() {
        let fixture = gallery();
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        let painting = context.new_object("Painting").unwrap();

        artist.add_to_many("paintings", &painting).unwrap();
        let owner = painting.to_one("artist").unwrap().unwrap();
        assert!(Arc::ptr_eq(&owner, &artist));

        artist.remove_from_many("paintings", &painting).unwrap();
        assert!(painting.to_one("artist").unwrap().is_none());
    }

    #[test]
    fn test_add_to_faulted_list_replays_on_resolution() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        seed_painting(&fixture.db, 10, "B", Some(1));
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let painting = context.new_object("Painting").unwrap();
        painting.write_property("title", "A").unwrap();

        artist.add_to_many("paintings", &painting).unwrap();
        assert!(artist.is_fault("paintings"));

        let titles: Vec<String> = artist
            .to_many("paintings")
            .unwrap()
            .iter()
            .map(|p| p.get::<String>("title").unwrap())
            .collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn test_relating_objects_of_another_context_fails() {
        let fixture = gallery();
        let a = fixture.context();
        let b = fixture.context();
        let artist = a.new_object("Artist").unwrap();
        let painting = b.new_object("Painting").unwrap();
        assert!(painting.set_to_one("artist", Some(&artist)).is_err());
    }

    #[test]
    fn test_many_to_many_records_one_link_change() {
        let fixture = gallery();
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        let group = context.new_object("ArtGroup").unwrap();

        artist.add_to_many("groups", &group).unwrap();
        let members = group.to_many("artists").unwrap();
        assert!(Arc::ptr_eq(&members[0], &artist));
        context.with_object_store(|store| assert_eq!(store.flattened().len(), 1));

        group.remove_from_many("artists", &artist).unwrap();
        assert!(artist.to_many("groups").unwrap().is_empty());
        context.with_object_store(|store| assert!(store.flattened().is_empty()));
    }

    #[test]
    fn test_delete_nullifies_reverse_relationships() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        seed_painting(&fixture.db, 10, "Water Lilies", Some(1));
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let painting = context.select(&ObjectSelect::query("Painting")).unwrap().remove(0);

        context.delete_object(&artist).unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Deleted);
        assert!(painting.to_one("artist").unwrap().is_none());
        assert_eq!(painting.persistence_state(), PersistenceState::Modified);
    }

    #[test]
    fn test_deny_rule_blocks_delete() {
        let fixture = gallery();
        fixture
            .db
            .insert_row("GALLERY", DataRow::new().with("GALLERY_ID", 5).with("GALLERY_NAME", "Orsay"))
            .unwrap();
        fixture
            .db
            .insert_row(
                "PAINTING",
                DataRow::new()
                    .with("PAINTING_ID", 10)
                    .with("PAINTING_TITLE", "Olympia")
                    .with("KIND", "P")
                    .with("GALLERY_ID", 5),
            )
            .unwrap();
        let context = fixture.context();
        let gallery = context.select(&ObjectSelect::query("Gallery")).unwrap().remove(0);

        let err = context.delete_object(&gallery).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(gallery.persistence_state(), PersistenceState::Committed);
        assert!(!context.has_changes());
    }

    #[test]
    fn test_deleting_a_new_object_forgets_it() {
        let fixture = gallery();
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        context.delete_object(&artist).unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Transient);
        assert_eq!(context.registered_objects_count(), 0);
        assert!(!context.has_changes());
    }

    #[test]
    fn test_rollback_restores_committed_values() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let created = context.new_object("Artist").unwrap();

        artist.write_property("name", "Manet").unwrap();
        context.rollback_changes().unwrap();

        assert!(!context.has_changes());
        assert_eq!(created.persistence_state(), PersistenceState::Transient);
        assert_eq!(artist.persistence_state(), PersistenceState::Hollow);
        assert_eq!(artist.get::<String>("name").unwrap(), "Monet");
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
    }

    #[test]
    fn test_invalidate_refetches_on_next_read() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let id = artist.object_id().unwrap();

        fixture.db.update_rows(
            "ARTIST",
            &Qualifier::eq("ARTIST_ID", 1),
            &[("ARTIST_NAME", Value::from("Claude Monet"))],
        );
        context.invalidate_objects(std::slice::from_ref(&artist)).unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Hollow);
        assert!(context.get_cached_snapshot(&id).is_none());
        assert_eq!(artist.get::<String>("name").unwrap(), "Claude Monet");
    }
}
