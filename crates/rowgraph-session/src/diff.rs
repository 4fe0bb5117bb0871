//! Pending changes recorded between commits.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rowgraph_core::{DataRow, ObjectId, Value};

use crate::object::{self, ObjectData, ObjectRef, PersistenceState};

/// One recorded mutation of the object graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphDiff {
    NodeCreated(ObjectId),
    NodeDeleted(ObjectId),
    AttributeChanged {
        id: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    ArcCreated {
        id: ObjectId,
        relationship: String,
        target: ObjectId,
    },
    ArcDeleted {
        id: ObjectId,
        relationship: String,
        target: ObjectId,
    },
}

impl fmt::Display for GraphDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphDiff::NodeCreated(id) => write!(f, "create {}", id),
            GraphDiff::NodeDeleted(id) => write!(f, "delete {}", id),
            GraphDiff::AttributeChanged {
                id,
                property,
                old,
                new,
            } => write!(f, "{}.{}: {} -> {}", id, property, old, new),
            GraphDiff::ArcCreated {
                id,
                relationship,
                target,
            } => write!(f, "{}.{} += {}", id, relationship, target),
            GraphDiff::ArcDeleted {
                id,
                relationship,
                target,
            } => write!(f, "{}.{} -= {}", id, relationship, target),
        }
    }
}

/// Accumulated changes of one object.
pub(crate) struct ObjectDiff {
    pub(crate) object: ObjectRef,
    /// Registration order, used to keep commits deterministic.
    pub(crate) sequence: u64,
    /// Committed row the object was modified from; the source of lock
    /// values. `None` for objects created in this context.
    pub(crate) baseline: Option<Arc<DataRow>>,
    pub(crate) modified_attributes: BTreeSet<String>,
    pub(crate) modified_to_one: BTreeSet<String>,
    pub(crate) touched_to_many: BTreeSet<String>,
    pub(crate) log: Vec<GraphDiff>,
}

impl ObjectDiff {
    pub(crate) fn new(object: ObjectRef, sequence: u64, baseline: Option<Arc<DataRow>>) -> Self {
        Self {
            object,
            sequence,
            baseline,
            modified_attributes: BTreeSet::new(),
            modified_to_one: BTreeSet::new(),
            touched_to_many: BTreeSet::new(),
            log: Vec::new(),
        }
    }

    /// Value of an attribute's column in the baseline row.
    pub(crate) fn baseline_value(&self, column: &str) -> Value {
        self.baseline
            .as_ref()
            .and_then(|row| row.get(column).cloned())
            .unwrap_or(Value::Null)
    }

    /// True if `property` was written locally and still differs from the
    /// baseline.
    pub(crate) fn is_attribute_modified(&self, data: &ObjectData, property: &str) -> bool {
        if !self.modified_attributes.contains(property) {
            return false;
        }
        let Some(attr) = data.entity.attribute_info(property) else {
            return false;
        };
        let current = data.values.get(property).cloned().unwrap_or(Value::Null);
        !current.matches(&self.baseline_value(&attr.column))
    }

    /// A MODIFIED object whose every change has been reverted.
    pub(crate) fn is_noop(&self) -> bool {
        let data = self.object.read();
        match data.state {
            PersistenceState::New | PersistenceState::Deleted => false,
            PersistenceState::Modified => {
                self.modified_to_one.is_empty()
                    && self.touched_to_many.is_empty()
                    && !self
                        .modified_attributes
                        .iter()
                        .any(|p| self.is_attribute_modified(&data, p))
            }
            _ => true,
        }
    }
}

impl fmt::Debug for ObjectDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDiff")
            .field("sequence", &self.sequence)
            .field("modified_attributes", &self.modified_attributes)
            .field("modified_to_one", &self.modified_to_one)
            .field("touched_to_many", &self.touched_to_many)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

/// A pending link-table row change of a flattened relationship.
#[derive(Clone)]
pub(crate) struct FlattenedArc {
    pub(crate) source: ObjectRef,
    pub(crate) relationship: String,
    pub(crate) reverse: Option<String>,
    pub(crate) target: ObjectRef,
    pub(crate) added: bool,
}

impl FlattenedArc {
    /// True if both describe the same link row, from either side.
    pub(crate) fn same_link(&self, other: &FlattenedArc) -> bool {
        let forward = object::same(&self.source, &other.source)
            && object::same(&self.target, &other.target)
            && self.relationship == other.relationship;
        let backward = object::same(&self.source, &other.target)
            && object::same(&self.target, &other.source)
            && other.reverse.as_deref() == Some(self.relationship.as_str());
        forward || backward
    }

    pub(crate) fn involves(&self, object: &ObjectRef) -> bool {
        object::same(&self.source, object) || object::same(&self.target, object)
    }
}

impl fmt::Debug for FlattenedArc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlattenedArc")
            .field("source", &self.source.object_id())
            .field("relationship", &self.relationship)
            .field("target", &self.target.object_id())
            .field("added", &self.added)
            .finish()
    }
}
