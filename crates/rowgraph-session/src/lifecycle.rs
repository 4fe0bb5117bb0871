//! Per-entity lifecycle callbacks.
//!
//! Callbacks are registered on a [`DataDomain`](crate::DataDomain) for one
//! entity and fire for objects of that entity and its subentities in every
//! context of the domain. They run once the object's context has released
//! its store, so a callback may read and write the object it receives.
//!
//! `PrePersist` and `PreUpdate` run at the start of a commit and abort it by
//! returning `Err`. Every other event is delivered after the operation that
//! caused it; errors from those are logged and dropped.

use std::sync::Arc;

use parking_lot::RwLock;
use rowgraph_core::{EntityResolver, Result};

use crate::object::ObjectRef;

type LifecycleFn = Arc<dyn Fn(&ObjectRef) -> Result<()> + Send + Sync>;

/// Points in an object's life a callback can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A NEW object was created in a context.
    PostAdd,
    /// A NEW object is about to be inserted.
    PrePersist,
    /// A NEW object was inserted and has its permanent id.
    PostPersist,
    /// A MODIFIED object is about to be updated.
    PreUpdate,
    PostUpdate,
    /// An object was marked for deletion.
    PreRemove,
    /// A deleted object's row is gone; the object is TRANSIENT.
    PostRemove,
    /// An object was filled from a fetched or cached row.
    PostLoad,
}

struct Registration {
    event: LifecycleEvent,
    entity: String,
    callback: LifecycleFn,
}

/// Callbacks of a domain, fired in registration order.
#[derive(Default)]
pub struct LifecycleCallbacks {
    registrations: RwLock<Vec<Registration>>,
}

impl std::fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("registered", &self.registrations.read().len())
            .finish()
    }
}

impl LifecycleCallbacks {
    /// Run `callback` on `event` for objects of `entity` or its subentities.
    pub fn add(
        &self,
        event: LifecycleEvent,
        entity: impl Into<String>,
        callback: impl Fn(&ObjectRef) -> Result<()> + Send + Sync + 'static,
    ) {
        let entity = entity.into();
        tracing::debug!(event = ?event, entity = %entity, "Registered lifecycle callback");
        self.registrations.write().push(Registration {
            event,
            entity,
            callback: Arc::new(callback),
        });
    }

    /// True if any callback listens for `event`.
    pub fn has(&self, event: LifecycleEvent) -> bool {
        self.registrations.read().iter().any(|r| r.event == event)
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.registrations.write().clear();
    }

    /// Run the callbacks matching `object`'s entity, stopping at the first
    /// error.
    pub(crate) fn fire(&self, resolver: &EntityResolver, event: LifecycleEvent, object: &ObjectRef) -> Result<()> {
        let entity = object.entity_name();
        let matching: Vec<LifecycleFn> = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.event == event && resolver.is_kind_of(&entity, &r.entity))
            .map(|r| Arc::clone(&r.callback))
            .collect();
        for callback in matching {
            callback(object)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::gallery;
    use crate::{ObjectSelect, PersistenceState};
    use parking_lot::Mutex;
    use rowgraph_core::{DataRow, Error, ObjectId, Value};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&ObjectRef) -> Result<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |object: &ObjectRef| {
            log.lock().push(format!("{}:{}", tag, object.entity_name()));
            Ok(())
        }
    }

    #[test]
    fn test_post_add_and_pre_persist() {
        let fixture = gallery();
        let log = Arc::new(Mutex::new(Vec::new()));
        let callbacks = fixture.domain.callbacks();
        callbacks.add(LifecycleEvent::PostAdd, "Artist", recorder(&log, "add"));
        callbacks.add(LifecycleEvent::PrePersist, "Artist", recorder(&log, "persist"));
        callbacks.add(LifecycleEvent::PostPersist, "Artist", recorder(&log, "persisted"));
        assert!(callbacks.has(LifecycleEvent::PostAdd));
        assert!(!callbacks.has(LifecycleEvent::PostLoad));

        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        assert_eq!(*log.lock(), vec!["add:Artist"]);
        artist.write_property("name", "Monet").unwrap();
        context.commit_changes().unwrap();
        assert_eq!(*log.lock(), vec!["add:Artist", "persist:Artist", "persisted:Artist"]);
    }

    #[test]
    fn test_pre_persist_can_fill_values_before_insert() {
        let fixture = gallery();
        fixture.domain.callbacks().add(LifecycleEvent::PrePersist, "Artist", |artist: &ObjectRef| {
            if artist.read_property("dateOfBirth")?.is_null() {
                artist.write_property("dateOfBirth", "unknown")?;
            }
            Ok(())
        });
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        artist.write_property("name", "Monet").unwrap();
        context.commit_changes().unwrap();

        let rows = fixture.db.rows("ARTIST");
        assert_eq!(rows[0].get("DATE_OF_BIRTH"), Some(&Value::from("unknown")));
    }

    #[test]
    fn test_pre_update_error_aborts_commit() {
        let fixture = gallery();
        fixture
            .db
            .insert_row("ARTIST", DataRow::new().with("ARTIST_ID", 1).with("ARTIST_NAME", "Monet"))
            .unwrap();
        fixture.domain.callbacks().add(LifecycleEvent::PreUpdate, "Artist", |_: &ObjectRef| {
            Err(Error::Custom("artists are read-only".into()))
        });
        let context = fixture.context();
        let artist = context
            .object_for_id(&ObjectId::single("Artist", "ARTIST_ID", 1))
            .unwrap()
            .unwrap();
        artist.write_property("name", "Claude Monet").unwrap();

        assert!(context.commit_changes().is_err());
        assert_eq!(artist.persistence_state(), PersistenceState::Modified);
        assert_eq!(fixture.db.rows("ARTIST")[0].get("ARTIST_NAME"), Some(&Value::from("Monet")));
    }

    #[test]
    fn test_post_load_fires_on_fetch_not_on_commit() {
        let fixture = gallery();
        let log = Arc::new(Mutex::new(Vec::new()));
        fixture
            .domain
            .callbacks()
            .add(LifecycleEvent::PostLoad, "Artist", recorder(&log, "load"));
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        artist.write_property("name", "Monet").unwrap();
        context.commit_changes().unwrap();
        assert!(log.lock().is_empty());

        let other = fixture.domain.create_context_with(crate::ContextConfig::isolated());
        let id = artist.object_id().unwrap();
        let hollow = other.local_object_by_id(&id).unwrap();
        assert!(log.lock().is_empty());
        hollow.read_property("name").unwrap();
        assert_eq!(*log.lock(), vec!["load:Artist"]);

        other.select(&ObjectSelect::query("Artist")).unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_callbacks_match_subentities() {
        let fixture = gallery();
        let log = Arc::new(Mutex::new(Vec::new()));
        fixture
            .domain
            .callbacks()
            .add(LifecycleEvent::PostAdd, "Painting", recorder(&log, "add"));
        let context = fixture.context();
        context.new_object("Sketch").unwrap();
        context.new_object("Artist").unwrap();
        assert_eq!(*log.lock(), vec!["add:Sketch"]);
    }

    #[test]
    fn test_remove_callbacks_bracket_the_delete() {
        let fixture = gallery();
        fixture
            .db
            .insert_row("ARTIST", DataRow::new().with("ARTIST_ID", 1).with("ARTIST_NAME", "Monet"))
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let callbacks = fixture.domain.callbacks();
        callbacks.add(LifecycleEvent::PreRemove, "Artist", recorder(&log, "remove"));
        callbacks.add(LifecycleEvent::PostRemove, "Artist", {
            let log = Arc::clone(&log);
            move |artist: &ObjectRef| {
                log.lock().push(format!("removed:{}", artist.persistence_state()));
                Ok(())
            }
        });
        let context = fixture.context();
        let artist = context
            .object_for_id(&ObjectId::single("Artist", "ARTIST_ID", 1))
            .unwrap()
            .unwrap();
        context.delete_object(&artist).unwrap();
        assert_eq!(*log.lock(), vec!["remove:Artist"]);
        context.commit_changes().unwrap();
        assert_eq!(*log.lock(), vec!["remove:Artist", "removed:TRANSIENT"]);
    }

    #[test]
    fn test_failing_post_callback_does_not_fail_the_operation() {
        let fixture = gallery();
        fixture
            .domain
            .callbacks()
            .add(LifecycleEvent::PostAdd, "Artist", |_: &ObjectRef| Err(Error::Custom("ignored".into())));
        let context = fixture.context();
        assert!(context.new_object("Artist").is_ok());
    }
}
