//! Change events broadcast by the snapshot store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use rowgraph_core::{DataRow, ObjectId, Value};

/// Identity of a store subscriber, usually one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

/// A batch of changes to apply to the store atomically.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChanges {
    /// New or replaced rows.
    pub updated: Vec<(ObjectId, DataRow)>,
    /// Rows deleted from the database.
    pub deleted: Vec<ObjectId>,
    /// Rows whose cached state should be dropped.
    pub invalidated: Vec<ObjectId>,
    /// Objects whose to-many relationships changed without a row change.
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotChanges {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}

/// Notification delivered to subscribers after `process_changes`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotEvent {
    /// Subscriber that caused the change, if any.
    pub source: Option<SubscriberId>,
    /// Changed columns per updated object.
    pub modified: HashMap<ObjectId, BTreeMap<String, Value>>,
    pub deleted: Vec<ObjectId>,
    pub invalidated: Vec<ObjectId>,
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotEvent {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }

    /// True if the event was posted by `subscriber`.
    pub fn posted_by(&self, subscriber: SubscriberId) -> bool {
        self.source == Some(subscriber)
    }
}

/// Receiver of snapshot change events.
///
/// Called synchronously on the thread that posted the change, after the
/// store's lock has been released. Implementations must not block on work
/// owned by the posting thread.
pub trait SnapshotListener: Send + Sync {
    fn snapshots_changed(&self, event: &SnapshotEvent);
}
