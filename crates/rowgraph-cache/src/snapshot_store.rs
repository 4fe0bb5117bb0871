//! LRU snapshot store shared between sessions.
//!
//! Rows are stored as `Arc<DataRow>` and replaced wholesale, never mutated in
//! place, so a reader holding a row always sees one consistent version.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rowgraph_core::{DataRow, ObjectId};

use crate::config::SnapshotStoreConfig;
use crate::event::{SnapshotChanges, SnapshotEvent, SnapshotListener, SubscriberId};

/// Hit/miss counters of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Size-bounded cache of committed row snapshots keyed by object id.
///
/// # Example
///
/// ```
/// use rowgraph_cache::{SnapshotStore, SnapshotStoreConfig};
/// use rowgraph_core::{DataRow, ObjectId};
///
/// let store = SnapshotStore::new(SnapshotStoreConfig::bounded(2));
/// let id = ObjectId::single("Artist", "ARTIST_ID", 1);
/// store.put(id.clone(), DataRow::new().with("ARTIST_ID", 1));
/// assert!(store.get(&id).is_some());
/// ```
pub struct SnapshotStore {
    name: String,
    max_size: Option<NonZeroUsize>,
    snapshots: Mutex<LruCache<ObjectId, Arc<DataRow>>>,
    listeners: RwLock<Vec<(SubscriberId, Weak<dyn SnapshotListener>)>>,
    next_subscriber: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SnapshotStore {
    pub fn new(config: SnapshotStoreConfig) -> Self {
        let snapshots = match config.max_size {
            Some(size) => LruCache::new(size),
            None => LruCache::unbounded(),
        };
        Self {
            name: config.name,
            max_size: config.max_size,
            snapshots: Mutex::new(snapshots),
            listeners: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured capacity; `None` when unbounded.
    pub fn maximum_size(&self) -> Option<usize> {
        self.max_size.map(NonZeroUsize::get)
    }

    /// Number of cached rows.
    pub fn size(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Cached row for `id`, marking it most recently used.
    pub fn get(&self, id: &ObjectId) -> Option<Arc<DataRow>> {
        let found = self.snapshots.lock().get(id).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Cached row for `id` without touching its recency.
    pub fn peek(&self, id: &ObjectId) -> Option<Arc<DataRow>> {
        self.snapshots.lock().peek(id).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.snapshots.lock().contains(id)
    }

    /// Store a row without notifying subscribers.
    pub fn put(&self, id: ObjectId, row: DataRow) {
        self.insert_locked(&mut self.snapshots.lock(), id, Arc::new(row));
    }

    /// Drop the cached row for `id` without notifying subscribers.
    pub fn invalidate(&self, id: &ObjectId) -> bool {
        self.snapshots.lock().pop(id).is_some()
    }

    /// Drop every cached row.
    pub fn clear(&self) {
        self.snapshots.lock().clear();
    }

    /// Register a listener. The store holds it weakly; a dropped listener is
    /// pruned on the next broadcast.
    pub fn subscribe(&self, listener: Weak<dyn SnapshotListener>) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        tracing::trace!(store = %self.name, subscriber = %id, "Subscribed to snapshot events");
        id
    }

    pub fn unsubscribe(&self, subscriber: SubscriberId) {
        self.listeners.write().retain(|(id, _)| *id != subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Apply a batch of changes atomically, then notify every subscriber
    /// except `source`.
    ///
    /// An updated row replaces the cached one only if it records the cached
    /// row's version as the version it replaces. Otherwise the two were
    /// produced concurrently and the cached entry is dropped.
    pub fn process_changes(
        &self,
        source: Option<SubscriberId>,
        changes: SnapshotChanges,
    ) -> SnapshotEvent {
        let mut event = SnapshotEvent {
            source,
            ..SnapshotEvent::default()
        };
        {
            let mut snapshots = self.snapshots.lock();
            for (id, row) in changes.updated {
                let previous = snapshots.peek(&id).cloned();
                match previous {
                    Some(old) if row.replaces_version() != Some(old.version()) => {
                        tracing::warn!(
                            store = %self.name,
                            id = %id,
                            cached_version = old.version(),
                            replaces_version = ?row.replaces_version(),
                            "Snapshot version changed concurrently; dropping cached row"
                        );
                        snapshots.pop(&id);
                    }
                    Some(old) => {
                        let diff = old.diff(&row);
                        self.insert_locked(&mut snapshots, id.clone(), Arc::new(row));
                        if !diff.is_empty() {
                            event.modified.insert(id, diff);
                        }
                    }
                    None => {
                        let diff = row.values().clone();
                        self.insert_locked(&mut snapshots, id.clone(), Arc::new(row));
                        event.modified.insert(id, diff);
                    }
                }
            }
            for id in &changes.deleted {
                snapshots.pop(id);
            }
            for id in &changes.invalidated {
                snapshots.pop(id);
            }
        }
        event.deleted = changes.deleted;
        event.invalidated = changes.invalidated;
        event.indirectly_modified = changes.indirectly_modified;

        tracing::debug!(
            store = %self.name,
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            indirectly_modified = event.indirectly_modified.len(),
            "Processed snapshot changes"
        );

        if !event.is_empty() {
            self.broadcast(&event);
        }
        event
    }

    /// Record rows just fetched for objects.
    ///
    /// A row is stored when none is cached or when `refresh` is set. A
    /// refreshed row equal to the cached one keeps the cached version.
    /// Returns the version each object should remember, in input order.
    pub fn rows_fetched(
        &self,
        source: Option<SubscriberId>,
        rows: Vec<(ObjectId, DataRow)>,
        refresh: bool,
    ) -> Vec<u64> {
        let mut versions = Vec::with_capacity(rows.len());
        let mut changes = SnapshotChanges::default();
        {
            let mut snapshots = self.snapshots.lock();
            for (id, mut row) in rows {
                match snapshots.get(&id).cloned() {
                    None => {
                        versions.push(row.version());
                        self.insert_locked(&mut snapshots, id, Arc::new(row));
                    }
                    Some(cached) if !refresh || *cached == row => {
                        versions.push(cached.version());
                    }
                    Some(cached) => {
                        row.set_replaces_version(Some(cached.version()));
                        versions.push(row.version());
                        changes.updated.push((id, row));
                    }
                }
            }
        }
        if !changes.is_empty() {
            self.process_changes(source, changes);
        }
        versions
    }

    fn insert_locked(&self, snapshots: &mut LruCache<ObjectId, Arc<DataRow>>, id: ObjectId, row: Arc<DataRow>) {
        if let Some((evicted, _)) = snapshots.push(id.clone(), row) {
            if evicted != id {
                tracing::trace!(store = %self.name, evicted = %evicted, "Evicted snapshot");
            }
        }
    }

    fn broadcast(&self, event: &SnapshotEvent) {
        let targets: Vec<Arc<dyn SnapshotListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|(_, l)| l.strong_count() > 0);
            listeners
                .iter()
                .filter(|(id, _)| Some(*id) != event.source)
                .filter_map(|(_, l)| l.upgrade())
                .collect()
        };
        for listener in targets {
            listener.snapshots_changed(event);
        }
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(SnapshotStoreConfig::default())
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::Value;
    use std::collections::BTreeMap;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Artist", "ARTIST_ID", n)
    }

    fn row(n: i64, name: &str) -> DataRow {
        DataRow::new().with("ARTIST_ID", n).with("ARTIST_NAME", name)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SnapshotEvent>>,
    }

    impl SnapshotListener for Recorder {
        fn snapshots_changed(&self, event: &SnapshotEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn test_lru_eviction_drops_least_recently_touched() {
        let store = SnapshotStore::new(SnapshotStoreConfig::bounded(2));
        store.put(id(1), row(1, "a"));
        store.put(id(2), row(2, "b"));
        // touch 1 so 2 becomes the eviction candidate
        assert!(store.get(&id(1)).is_some());
        store.put(id(3), row(3, "c"));

        assert_eq!(store.size(), 2);
        assert!(store.contains(&id(1)));
        assert!(!store.contains(&id(2)));
        assert!(store.contains(&id(3)));
    }

    #[test]
    fn test_unbounded_by_default() {
        let store = SnapshotStore::default();
        for n in 0..100 {
            store.put(id(n), row(n, "x"));
        }
        assert_eq!(store.size(), 100);
        assert_eq!(store.maximum_size(), None);
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let store = SnapshotStore::default();
        store.put(id(1), row(1, "a"));
        store.get(&id(1));
        store.get(&id(2));
        assert_eq!(store.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_process_changes_notifies_everyone_but_the_source() {
        let store = SnapshotStore::default();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let a_weak: Weak<dyn SnapshotListener> = Arc::downgrade(&a) as Weak<dyn SnapshotListener>;
        let b_weak: Weak<dyn SnapshotListener> = Arc::downgrade(&b) as Weak<dyn SnapshotListener>;
        let a_id = store.subscribe(a_weak);
        store.subscribe(b_weak);

        let old = row(1, "v1");
        let mut changes = BTreeMap::new();
        changes.insert("ARTIST_NAME".to_string(), Value::from("v2"));
        let new = old.apply_diff(&changes);
        store.put(id(1), old);

        let event = store.process_changes(
            Some(a_id),
            SnapshotChanges {
                updated: vec![(id(1), new)],
                ..SnapshotChanges::default()
            },
        );
        assert_eq!(event.modified[&id(1)], changes);
        assert!(a.events.lock().is_empty());
        assert_eq!(b.events.lock().len(), 1);
        assert_eq!(
            store.get(&id(1)).unwrap().get("ARTIST_NAME"),
            Some(&Value::from("v2"))
        );
    }

    #[test]
    fn test_concurrent_version_forgets_cached_row() {
        let store = SnapshotStore::default();
        store.put(id(1), row(1, "v1"));
        // built from some other version than the cached one
        let unrelated = row(1, "v9");
        let event = store.process_changes(
            None,
            SnapshotChanges {
                updated: vec![(id(1), unrelated)],
                ..SnapshotChanges::default()
            },
        );
        assert!(event.modified.is_empty());
        assert!(store.get(&id(1)).is_none());
    }

    #[test]
    fn test_deleted_and_invalidated_rows_are_removed() {
        let store = SnapshotStore::default();
        store.put(id(1), row(1, "a"));
        store.put(id(2), row(2, "b"));
        let event = store.process_changes(
            None,
            SnapshotChanges {
                deleted: vec![id(1)],
                invalidated: vec![id(2)],
                ..SnapshotChanges::default()
            },
        );
        assert!(store.is_empty());
        assert_eq!(event.deleted, vec![id(1)]);
        assert_eq!(event.invalidated, vec![id(2)]);
    }

    #[test]
    fn test_rows_fetched_keeps_cached_version_when_unchanged() {
        let store = SnapshotStore::default();
        let first = row(1, "a");
        let first_version = first.version();
        let versions = store.rows_fetched(None, vec![(id(1), first)], false);
        assert_eq!(versions, vec![first_version]);

        let same = row(1, "a");
        let versions = store.rows_fetched(None, vec![(id(1), same)], true);
        assert_eq!(versions, vec![first_version]);

        let changed = row(1, "b");
        let changed_version = changed.version();
        let versions = store.rows_fetched(None, vec![(id(1), changed)], true);
        assert_eq!(versions, vec![changed_version]);
        assert_eq!(store.get(&id(1)).unwrap().version(), changed_version);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let store = SnapshotStore::default();
        {
            let gone = Arc::new(Recorder::default());
            let weak: Weak<dyn SnapshotListener> = Arc::downgrade(&gone) as Weak<dyn SnapshotListener>;
            store.subscribe(weak);
        }
        store.process_changes(
            None,
            SnapshotChanges {
                invalidated: vec![id(1)],
                ..SnapshotChanges::default()
            },
        );
        assert_eq!(store.subscriber_count(), 0);
    }
}
