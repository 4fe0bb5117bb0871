//! Persistent objects and their relationship slots.
//!
//! A [`PersistentObject`] is owned by exactly one [`DataContext`]'s object
//! store. Its state sits behind a read-write lock so that snapshot changes
//! delivered from other sessions are applied atomically: a concurrent reader
//! sees either the whole old state or the whole new one.
//!
//! [`DataContext`]: crate::DataContext

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rowgraph_core::{EntityInfo, Error, FromValue, ObjectId, Result, Value};
use serde::{Deserialize, Serialize};

use crate::context::ContextInner;

/// Shared handle to a persistent object.
pub type ObjectRef = Arc<PersistentObject>;

/// Lifecycle state of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not registered with any context.
    Transient,
    /// Registered, not yet inserted.
    New,
    /// In sync with its last known snapshot.
    Committed,
    /// Changed locally since the last commit.
    Modified,
    /// Identity only; attributes are fetched on first access.
    Hollow,
    /// Marked for deletion on the next commit.
    Deleted,
}

impl PersistenceState {
    pub const fn name(self) -> &'static str {
        match self {
            PersistenceState::Transient => "TRANSIENT",
            PersistenceState::New => "NEW",
            PersistenceState::Committed => "COMMITTED",
            PersistenceState::Modified => "MODIFIED",
            PersistenceState::Hollow => "HOLLOW",
            PersistenceState::Deleted => "DELETED",
        }
    }

    /// States with uncommitted changes.
    pub const fn is_dirty(self) -> bool {
        matches!(
            self,
            PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
        )
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a to-one relationship.
#[derive(Clone, Default)]
pub enum ToOneSlot {
    /// Not fetched yet.
    #[default]
    Fault,
    Resolved(Option<ObjectRef>),
}

/// Value of a to-many relationship.
#[derive(Clone)]
pub enum ToManySlot {
    /// Not fetched yet. Objects added or removed meanwhile are replayed on
    /// top of the fetched list.
    Fault {
        added: Vec<ObjectRef>,
        removed: Vec<ObjectRef>,
    },
    Resolved(Vec<ObjectRef>),
}

impl ToManySlot {
    pub(crate) fn fault() -> Self {
        ToManySlot::Fault {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, ToManySlot::Fault { .. })
    }
}

impl Default for ToManySlot {
    fn default() -> Self {
        Self::fault()
    }
}

/// Mutable state of a persistent object.
pub(crate) struct ObjectData {
    pub(crate) id: Option<ObjectId>,
    pub(crate) entity: Arc<EntityInfo>,
    pub(crate) state: PersistenceState,
    /// Attribute values by property name; empty while HOLLOW.
    pub(crate) values: BTreeMap<String, Value>,
    pub(crate) to_one: BTreeMap<String, ToOneSlot>,
    pub(crate) to_many: BTreeMap<String, ToManySlot>,
    /// Version of the snapshot this object was last built from.
    pub(crate) snapshot_version: Option<u64>,
}

impl ObjectData {
    /// Fresh data with every relationship faulted.
    pub(crate) fn faulted(id: ObjectId, entity: Arc<EntityInfo>, state: PersistenceState) -> Self {
        let mut data = Self {
            id: Some(id),
            entity,
            state,
            values: BTreeMap::new(),
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
            snapshot_version: None,
        };
        data.reset_relationships();
        data
    }

    /// Data of an object created in a context: no values yet, every
    /// relationship resolved and empty.
    pub(crate) fn new_object(id: ObjectId, entity: Arc<EntityInfo>) -> Self {
        let mut to_one = BTreeMap::new();
        let mut to_many = BTreeMap::new();
        for rel in &entity.relationships {
            if rel.is_to_many() {
                to_many.insert(rel.name.clone(), ToManySlot::Resolved(Vec::new()));
            } else {
                to_one.insert(rel.name.clone(), ToOneSlot::Resolved(None));
            }
        }
        Self {
            id: Some(id),
            entity,
            state: PersistenceState::New,
            values: BTreeMap::new(),
            to_one,
            to_many,
            snapshot_version: None,
        }
    }

    /// Drop values and relationships, keeping the id.
    pub(crate) fn make_hollow(&mut self) {
        self.state = PersistenceState::Hollow;
        self.values.clear();
        self.snapshot_version = None;
        self.reset_relationships();
    }

    /// Turn every relationship back into a fault.
    pub(crate) fn reset_relationships(&mut self) {
        self.to_one.clear();
        self.to_many.clear();
        for rel in &self.entity.relationships {
            if rel.is_to_many() {
                self.to_many.insert(rel.name.clone(), ToManySlot::fault());
            } else {
                self.to_one.insert(rel.name.clone(), ToOneSlot::Fault);
            }
        }
    }

    pub(crate) fn id(&self) -> Result<&ObjectId> {
        self.id
            .as_ref()
            .ok_or_else(|| Error::state(None, "object has no id; it is not registered"))
    }

    pub(crate) fn attribute(&self, name: &str) -> Result<Value> {
        if self.entity.attribute_info(name).is_none() {
            return Err(Error::unknown_property(&self.entity.name, name));
        }
        Ok(self.values.get(name).cloned().unwrap_or(Value::Null))
    }
}

/// An object mapped to one row, registered in one context.
pub struct PersistentObject {
    data: RwLock<ObjectData>,
    context: Weak<ContextInner>,
}

impl PersistentObject {
    pub(crate) fn create(data: ObjectData, context: Weak<ContextInner>) -> ObjectRef {
        Arc::new(Self {
            data: RwLock::new(data),
            context,
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ObjectData> {
        self.data.write()
    }

    /// Write access unless another thread holds the object.
    pub(crate) fn try_write(&self) -> Option<RwLockWriteGuard<'_, ObjectData>> {
        self.data.try_write()
    }

    pub(crate) fn belongs_to(&self, context: &Weak<ContextInner>) -> bool {
        Weak::ptr_eq(&self.context, context)
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::state(self.object_id(), "the object's context has been dropped"))
    }

    /// Current id; `None` once the object has been unregistered.
    pub fn object_id(&self) -> Option<ObjectId> {
        self.data.read().id.clone()
    }

    pub fn entity_name(&self) -> String {
        self.data.read().entity.name.clone()
    }

    pub fn entity(&self) -> Arc<EntityInfo> {
        Arc::clone(&self.data.read().entity)
    }

    pub fn persistence_state(&self) -> PersistenceState {
        self.poll_context();
        self.data.read().state
    }

    pub fn snapshot_version(&self) -> Option<u64> {
        self.data.read().snapshot_version
    }

    /// True while `relationship` has not been fetched.
    pub fn is_fault(&self, relationship: &str) -> bool {
        let data = self.data.read();
        match (data.to_one.get(relationship), data.to_many.get(relationship)) {
            (Some(ToOneSlot::Fault), _) => true,
            (_, Some(slot)) => slot.is_fault(),
            _ => false,
        }
    }

    /// Read an attribute, fetching the row first if the object is HOLLOW.
    pub fn read_property(&self, name: &str) -> Result<Value> {
        self.poll_context();
        {
            let data = self.data.read();
            if data.state != PersistenceState::Hollow {
                return data.attribute(name);
            }
        }
        self.context()?.resolve_hollow(self)?;
        self.data.read().attribute(name)
    }

    /// Read an attribute converted to `T`.
    pub fn get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.read_property(name)?;
        T::from_value(&value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            other => other,
        })
    }

    /// Set an attribute, recording the change for the next commit.
    pub fn write_property(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        {
            let mut data = self.data.write();
            if data.state == PersistenceState::Transient {
                if data.entity.attribute_info(name).is_none() {
                    return Err(Error::unknown_property(&data.entity.name, name));
                }
                data.values.insert(name.to_string(), value);
                return Ok(());
            }
        }
        self.context()?.set_attribute(self, name, value)
    }

    /// Target of a to-one relationship, resolving its fault if needed.
    pub fn to_one(&self, relationship: &str) -> Result<Option<ObjectRef>> {
        self.poll_context();
        {
            let data = self.data.read();
            match data.to_one.get(relationship) {
                Some(ToOneSlot::Resolved(target)) => return Ok(target.clone()),
                Some(ToOneSlot::Fault) => {}
                None => return Err(Error::unknown_property(&data.entity.name, relationship)),
            }
        }
        self.context()?.resolve_to_one(self, relationship)
    }

    /// Point a to-one relationship at `target`, keeping the reverse side
    /// consistent.
    pub fn set_to_one(&self, relationship: &str, target: Option<&ObjectRef>) -> Result<()> {
        self.context()?.set_to_one(self, relationship, target)
    }

    /// Members of a to-many relationship, resolving its fault if needed.
    pub fn to_many(&self, relationship: &str) -> Result<Vec<ObjectRef>> {
        self.poll_context();
        {
            let data = self.data.read();
            match data.to_many.get(relationship) {
                Some(ToManySlot::Resolved(list)) => return Ok(list.clone()),
                Some(ToManySlot::Fault { .. }) => {}
                None => return Err(Error::unknown_property(&data.entity.name, relationship)),
            }
        }
        self.context()?.resolve_to_many(self, relationship)
    }

    pub fn add_to_many(&self, relationship: &str, target: &ObjectRef) -> Result<()> {
        self.context()?.add_to_many(self, relationship, target)
    }

    pub fn remove_from_many(&self, relationship: &str, target: &ObjectRef) -> Result<()> {
        self.context()?.remove_from_many(self, relationship, target)
    }

    /// Apply snapshot changes queued by other sessions, if any.
    fn poll_context(&self) {
        if let Some(context) = self.context.upgrade() {
            context.flush_inbox();
        }
    }
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.try_read() {
            Some(data) => f
                .debug_struct("PersistentObject")
                .field("entity", &data.entity.name)
                .field("id", &data.id)
                .field("state", &data.state)
                .field("values", &data.values)
                .finish_non_exhaustive(),
            None => f.debug_struct("PersistentObject").finish_non_exhaustive(),
        }
    }
}

/// Same object, compared by address.
pub(crate) fn same(a: &PersistentObject, b: &PersistentObject) -> bool {
    std::ptr::eq(a, b)
}

/// Neither unregistered nor marked for deletion.
pub(crate) fn is_live(object: &PersistentObject) -> bool {
    !matches!(
        object.read().state,
        PersistenceState::Transient | PersistenceState::Deleted
    )
}

pub(crate) fn contains(list: &[ObjectRef], object: &PersistentObject) -> bool {
    list.iter().any(|o| same(o, object))
}

pub(crate) fn remove(list: &mut Vec<ObjectRef>, object: &PersistentObject) -> bool {
    let before = list.len();
    list.retain(|o| !same(o, object));
    before != list.len()
}
