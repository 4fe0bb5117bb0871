//! Per-context registry of live objects and their pending changes.

use std::collections::HashMap;
use std::sync::Arc;

use rowgraph_core::{DataRow, EntityResolver, ObjectId};

use crate::diff::{FlattenedArc, GraphDiff, ObjectDiff};
use crate::object::{ObjectRef, PersistenceState, ToManySlot, ToOneSlot};

/// The graph manager of one context.
///
/// Holds at most one object per [`ObjectId`] and the diffs recorded for
/// objects changed since the last commit or rollback.
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, ObjectRef>,
    changes: HashMap<ObjectId, ObjectDiff>,
    flattened: Vec<FlattenedArc>,
    next_sequence: u64,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` under `id`, replacing any previous registration.
    pub fn register_node(&mut self, id: ObjectId, object: ObjectRef) {
        if let Some(previous) = self.objects.insert(id.clone(), object) {
            tracing::trace!(id = %id, ?previous, "Replaced registered object");
        }
    }

    pub fn get_node(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.objects.get(id).cloned()
    }

    /// Look up `id`, also trying subentities of its entity.
    ///
    /// Relationship targets name the declared entity while registered objects
    /// carry the concrete entity a row was dispatched to.
    pub fn find_registered(&self, resolver: &EntityResolver, id: &ObjectId) -> Option<ObjectRef> {
        if let Some(object) = self.objects.get(id) {
            return Some(Arc::clone(object));
        }
        if !resolver.has_subentities(id.entity_name()) {
            return None;
        }
        resolver
            .entities()
            .filter(|e| e.name != id.entity_name() && resolver.is_kind_of(&e.name, id.entity_name()))
            .find_map(|e| self.objects.get(&id.with_entity(&e.name)).cloned())
    }

    /// Detach objects from this store.
    ///
    /// Each object becomes TRANSIENT with no id. Relationship faults turn into
    /// their locally known value so the detached object stays readable.
    ///
    /// Shared snapshots are left alone. A committed delete evicts them
    /// through the snapshot store's change event, an object deleted by
    /// another context has already been evicted there, and a rolled back NEW
    /// object never had one. Only the object's own snapshot version is
    /// cleared here.
    pub fn unregister_nodes(&mut self, objects: &[ObjectRef]) {
        for object in objects {
            let id = {
                let mut data = object.write();
                let id = data.id.take();
                data.state = PersistenceState::Transient;
                data.snapshot_version = None;
                for slot in data.to_one.values_mut() {
                    if matches!(slot, ToOneSlot::Fault) {
                        *slot = ToOneSlot::Resolved(None);
                    }
                }
                for slot in data.to_many.values_mut() {
                    if let ToManySlot::Fault { added, .. } = slot {
                        *slot = ToManySlot::Resolved(std::mem::take(added));
                    }
                }
                id
            };
            if let Some(id) = id {
                self.objects.remove(&id);
                self.changes.remove(&id);
                tracing::trace!(id = %id, "Unregistered object");
            }
            self.flattened.retain(|arc| !arc.involves(object));
        }
    }

    /// Record `diff` for the object registered as `id`.
    pub(crate) fn register_diff(&mut self, id: &ObjectId, diff: GraphDiff) {
        if let Some(entry) = self.changes.get_mut(id) {
            entry.log.push(diff);
        }
    }

    /// Start tracking changes of `object`, keeping an existing entry.
    pub(crate) fn ensure_diff(
        &mut self,
        id: &ObjectId,
        object: &ObjectRef,
        baseline: Option<Arc<DataRow>>,
    ) -> &mut ObjectDiff {
        let sequence = self.next_sequence;
        let entry = self
            .changes
            .entry(id.clone())
            .or_insert_with(|| ObjectDiff::new(Arc::clone(object), sequence, baseline));
        if entry.sequence == sequence {
            self.next_sequence += 1;
        }
        entry
    }

    pub(crate) fn diff(&self, id: &ObjectId) -> Option<&ObjectDiff> {
        self.changes.get(id)
    }

    pub(crate) fn diff_mut(&mut self, id: &ObjectId) -> Option<&mut ObjectDiff> {
        self.changes.get_mut(id)
    }

    pub(crate) fn remove_diff(&mut self, id: &ObjectId) -> Option<ObjectDiff> {
        self.changes.remove(id)
    }

    /// Pending diffs in the order objects were first changed.
    pub(crate) fn pending(&self) -> Vec<&ObjectDiff> {
        let mut diffs: Vec<&ObjectDiff> = self.changes.values().collect();
        diffs.sort_by_key(|d| d.sequence);
        diffs
    }

    /// Recorded mutations per object.
    pub fn changes_by_object_id(&self) -> HashMap<ObjectId, Vec<GraphDiff>> {
        self.changes
            .iter()
            .map(|(id, diff)| (id.clone(), diff.log.clone()))
            .collect()
    }

    pub fn registered_objects_count(&self) -> usize {
        self.objects.len()
    }

    pub fn registered_objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.objects.values()
    }

    /// True if a commit would write anything.
    pub fn has_changes(&self) -> bool {
        !self.flattened.is_empty() || self.changes.values().any(|d| !d.is_noop())
    }

    /// Record a link-table change, cancelling the opposite pending change of
    /// the same link.
    pub(crate) fn record_flattened(&mut self, arc: FlattenedArc) {
        if let Some(pos) = self.flattened.iter().position(|a| a.same_link(&arc)) {
            if self.flattened[pos].added != arc.added {
                self.flattened.remove(pos);
            }
            return;
        }
        self.flattened.push(arc);
    }

    pub(crate) fn flattened(&self) -> &[FlattenedArc] {
        &self.flattened
    }

    pub(crate) fn forget_flattened(&mut self, object: &ObjectRef) {
        self.flattened.retain(|arc| !arc.involves(object));
    }

    /// Drop every pending change.
    pub(crate) fn clear_changes(&mut self) {
        self.changes.clear();
        self.flattened.clear();
    }

    /// Move a registration from a temporary id to its permanent one.
    pub(crate) fn rekey(&mut self, old: &ObjectId, new: ObjectId) {
        if let Some(object) = self.objects.remove(old) {
            self.objects.insert(new.clone(), object);
        }
        if let Some(diff) = self.changes.remove(old) {
            self.changes.insert(new, diff);
        }
    }
}

impl Drop for ObjectStore {
    // resolved relationships form reference cycles between objects
    fn drop(&mut self) {
        for object in self.objects.values() {
            if let Some(mut data) = object.try_write() {
                data.reset_relationships();
            }
        }
    }
}
