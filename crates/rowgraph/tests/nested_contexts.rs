//! Child contexts, lifecycle callbacks, cached queries and paginated lists
//! working together over one domain.

mod common;

use std::sync::Arc;

use common::{artist, gallery, painting};
use parking_lot::Mutex;
use rowgraph::{
    LifecycleEvent, ObjectId, ObjectRef, ObjectSelect, OrderBy, PersistenceState, QueryCacheStrategy, Result,
    Value,
};

fn artist_id(id: i64) -> ObjectId {
    ObjectId::single("Artist", "ARTIST_ID", id)
}

#[test]
fn child_edits_reach_the_database_only_through_the_parent() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    painting(&g.db, 10, "Water Lilies", 1);
    let parent = g.domain.create_context();
    let child = parent.create_child();

    let monet = child.object_for_id(&artist_id(1)).unwrap().unwrap();
    let lilies = monet.to_many("paintings").unwrap().remove(0);
    lilies.write_property("title", "Nympheas").unwrap();
    let sketch = child.new_object("Sketch").unwrap();
    sketch.write_property("title", "Study").unwrap();
    sketch.set_to_one("artist", Some(&monet)).unwrap();

    child.commit_changes_to_parent().unwrap();
    assert!(!child.has_changes());
    assert!(parent.has_changes());
    assert_eq!(parent.new_objects().len(), 1);
    assert_eq!(g.db.rows("PAINTING")[0].get("PAINTING_TITLE"), Some(&Value::from("Water Lilies")));

    parent.commit_changes().unwrap();
    let mut titles: Vec<Value> = g
        .db
        .rows("PAINTING")
        .iter()
        .filter_map(|r| r.get("PAINTING_TITLE").cloned())
        .collect();
    titles.sort_by_key(|v| v.to_string());
    assert_eq!(titles, vec![Value::from("Nympheas"), Value::from("Study")]);
    assert!(g.db.rows("PAINTING").iter().any(|r| r.get("KIND") == Some(&Value::from("S"))));
}

#[test]
fn child_delete_cascades_in_the_parent() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    painting(&g.db, 10, "Water Lilies", 1);
    let parent = g.domain.create_context();
    let child = parent.create_child();

    let monet = child.object_for_id(&artist_id(1)).unwrap().unwrap();
    child.delete_object(&monet).unwrap();
    assert_eq!(child.deleted_objects().len(), 2);

    child.commit_changes_to_parent().unwrap();
    assert_eq!(monet.persistence_state(), PersistenceState::Transient);
    assert_eq!(parent.deleted_objects().len(), 2);

    parent.commit_changes().unwrap();
    assert_eq!(g.db.row_count("ARTIST"), 0);
    assert_eq!(g.db.row_count("PAINTING"), 0);
}

#[test]
fn committing_a_child_commits_the_parent_too() {
    let g = gallery();
    let parent = g.domain.create_context();
    let from_parent = parent.new_object("Artist").unwrap();
    from_parent.write_property("name", "Degas").unwrap();

    let child = parent.create_child();
    let from_child = child.new_object("Artist").unwrap();
    from_child.write_property("name", "Cassatt").unwrap();
    child.commit_changes().unwrap();

    assert_eq!(g.db.row_count("ARTIST"), 2);
    assert_eq!(from_parent.persistence_state(), PersistenceState::Committed);
    assert!(!from_child.object_id().unwrap().is_temporary());
    assert!(!parent.has_changes());
}

#[test]
fn callbacks_see_every_context_of_the_domain() {
    let g = gallery();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |tag: &'static str| {
        let log = Arc::clone(&log);
        move |object: &ObjectRef| -> Result<()> {
            log.lock().push(format!("{} {}", tag, object.get::<String>("name")?));
            Ok(())
        }
    };
    g.domain.callbacks().add(LifecycleEvent::PrePersist, "Artist", record("insert"));
    g.domain.callbacks().add(LifecycleEvent::PostUpdate, "Artist", record("updated"));

    let parent = g.domain.create_context();
    let child = parent.create_child();
    let monet = child.new_object("Artist").unwrap();
    monet.write_property("name", "Monet").unwrap();
    child.commit_changes().unwrap();

    let other = g.domain.create_context();
    let copy = other.local_object(&monet).unwrap();
    copy.write_property("name", "Claude Monet").unwrap();
    other.commit_changes().unwrap();

    assert_eq!(*log.lock(), vec!["insert Monet", "updated Claude Monet"]);
}

#[test]
fn shared_query_cache_serves_every_context_until_its_group_is_removed() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    let select = ObjectSelect::query("Artist").cache(QueryCacheStrategy::SharedCache, &["artists"]);

    let a = g.domain.create_context();
    assert_eq!(a.select(&select).unwrap().len(), 1);
    let b = g.domain.create_context();
    assert_eq!(b.select(&select).unwrap().len(), 1);
    assert_eq!(g.db.query_count(), 1);

    artist(&g.db, 2, "Manet");
    assert_eq!(b.select(&select).unwrap().len(), 1);

    g.domain.remove_cache_group("artists");
    assert_eq!(b.select(&select).unwrap().len(), 2);
    assert_eq!(g.db.query_count(), 2);
}

#[test]
fn pages_of_a_large_result_are_fetched_on_demand() {
    let g = gallery();
    for id in 1..=7 {
        artist(&g.db, id, &format!("Artist {}", id));
    }
    let context = g.domain.create_context();
    let list = context
        .select_pages(&ObjectSelect::query("Artist").order_by(OrderBy::asc("ARTIST_ID")).page_size(3))
        .unwrap();
    assert_eq!(list.len(), 7);
    assert_eq!(context.registered_objects_count(), 3);

    let last = list.get(6).unwrap().unwrap();
    assert_eq!(last.get::<String>("name").unwrap(), "Artist 7");
    assert_eq!(context.registered_objects_count(), 4);
    assert_eq!(list.to_vec().unwrap().len(), 7);
}
