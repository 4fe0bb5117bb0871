//! Identity, faults, prefetching and commits within one context.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{artist, gallery, painting};
use rowgraph::{
    DataRow, ObjectId, ObjectRef, ObjectSelect, OrderBy, PersistenceState, PrefetchSemantics, Qualifier,
    QueryResult, Value,
};

fn titles(paintings: &[ObjectRef]) -> Vec<String> {
    paintings
        .iter()
        .map(|p| p.get::<String>("title").unwrap())
        .collect()
}

#[test]
fn one_object_per_identity_in_a_context() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    painting(&g.db, 10, "Water Lilies", 1);
    let context = g.domain.create_context();

    let first = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
    let second = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
    assert!(Arc::ptr_eq(&first, &second));

    let id = ObjectId::single("Artist", "ARTIST_ID", 1_i64);
    let by_id = context.object_for_id(&id).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &by_id));

    let through_fault = context
        .select(&ObjectSelect::query("Painting"))
        .unwrap()
        .remove(0)
        .to_one("artist")
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&first, &through_fault));
    assert_eq!(context.registered_objects_count(), 2);
}

#[test]
fn to_many_fault_reflects_current_rows_after_invalidation() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    painting(&g.db, 10, "Haystacks", 1);
    painting(&g.db, 11, "Water Lilies", 1);
    let context = g.domain.create_context();
    let monet = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
    assert_eq!(titles(&monet.to_many("paintings").unwrap()), vec!["Haystacks", "Water Lilies"]);

    g.db.delete_rows("PAINTING", &Qualifier::eq("PAINTING_ID", 10_i64));
    painting(&g.db, 12, "Rouen Cathedral", 1);
    // still the resolved list
    assert_eq!(monet.to_many("paintings").unwrap().len(), 2);

    context.invalidate_objects(&[Arc::clone(&monet)]).unwrap();
    assert_eq!(monet.persistence_state(), PersistenceState::Hollow);
    assert_eq!(
        titles(&monet.to_many("paintings").unwrap()),
        vec!["Rouen Cathedral", "Water Lilies"]
    );
}

#[test]
fn joint_prefetch_has_no_duplicate_members() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    for (id, title) in [(10, "Haystacks"), (11, "Water Lilies"), (12, "Rouen Cathedral")] {
        painting(&g.db, id, title, 1);
    }
    let context = g.domain.create_context();
    let artists = context
        .select(&ObjectSelect::query("Artist").prefetch("paintings", PrefetchSemantics::Joint))
        .unwrap();
    assert_eq!(artists.len(), 1);
    assert_eq!(g.db.query_count(), 1);

    let members = artists[0].to_many("paintings").unwrap();
    let distinct: HashSet<*const rowgraph::PersistentObject> = members.iter().map(Arc::as_ptr).collect();
    assert_eq!(members.len(), 3);
    assert_eq!(distinct.len(), members.len());
    assert_eq!(g.db.query_count(), 1);
}

#[test]
fn disjoint_by_id_prefetch_follows_the_row_limit() {
    let g = gallery();
    for (id, name) in [(1, "Monet"), (2, "Manet"), (3, "Degas")] {
        artist(&g.db, id, name);
        painting(&g.db, id * 10, &format!("{name} study"), id);
    }
    let context = g.domain.create_context();
    let artists = context
        .select(
            &ObjectSelect::query("Artist")
                .order_by(OrderBy::asc("ARTIST_ID"))
                .limit(2)
                .prefetch("paintings", PrefetchSemantics::DisjointById),
        )
        .unwrap();
    assert_eq!(artists.len(), 2);
    assert_eq!(g.db.query_count(), 2);

    let painting_id = |id: i64| ObjectId::single("Painting", "PAINTING_ID", id);
    assert!(context.get_node(&painting_id(10)).is_some());
    assert!(context.get_node(&painting_id(20)).is_some());
    assert!(context.get_node(&painting_id(30)).is_none());
    assert_eq!(titles(&artists[1].to_many("paintings").unwrap()), vec!["Manet study"]);
    assert_eq!(g.db.query_count(), 2);
}

#[test]
fn subentity_rows_become_subentity_objects() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    painting(&g.db, 10, "Water Lilies", 1);
    g.db.insert_row(
        "PAINTING",
        DataRow::new()
            .with("PAINTING_ID", 11_i64)
            .with("PAINTING_TITLE", "Study")
            .with("KIND", "S")
            .with("ARTIST_ID", 1_i64),
    )
    .unwrap();
    let context = g.domain.create_context();

    let all = context
        .select(&ObjectSelect::query("Painting").order_by(OrderBy::asc("PAINTING_ID")))
        .unwrap();
    let kinds: Vec<String> = all.iter().map(|p| p.entity_name()).collect();
    assert_eq!(kinds, vec!["Painting", "Sketch"]);

    let sketches = context.select(&ObjectSelect::query("Sketch")).unwrap();
    assert_eq!(sketches.len(), 1);
    assert!(Arc::ptr_eq(&sketches[0], &all[1]));
}

#[test]
fn data_row_queries_do_not_register_objects() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    let context = g.domain.create_context();
    let QueryResult::DataRows(rows) = context
        .perform_query(&ObjectSelect::query("Artist").data_rows())
        .unwrap()
    else {
        panic!("expected rows");
    };
    assert_eq!(rows[0].get("ARTIST_NAME"), Some(&Value::from("Monet")));
    assert_eq!(context.registered_objects_count(), 0);
}

#[test]
fn new_graph_commits_parents_first() {
    let g = gallery();
    let context = g.domain.create_context();
    let water_lilies = context.new_object("Painting").unwrap();
    water_lilies.write_property("title", "Water Lilies").unwrap();
    let monet = context.new_object("Artist").unwrap();
    monet.write_property("name", "Monet").unwrap();
    monet.add_to_many("paintings", &water_lilies).unwrap();
    assert!(Arc::ptr_eq(&water_lilies.to_one("artist").unwrap().unwrap(), &monet));

    context.commit_changes().unwrap();

    assert!(!context.has_changes());
    assert_eq!(monet.persistence_state(), PersistenceState::Committed);
    let monet_id = monet.object_id().unwrap();
    assert!(!monet_id.is_temporary());
    let rows = g.db.rows("PAINTING");
    assert_eq!(rows[0].get("ARTIST_ID"), monet_id.key_value("ARTIST_ID"));

    let fresh = g.domain.create_context();
    let loaded = fresh.object_for_id(&monet_id).unwrap().unwrap();
    assert_eq!(titles(&loaded.to_many("paintings").unwrap()), vec!["Water Lilies"]);
}

#[test]
fn cascade_delete_removes_dependent_rows() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    painting(&g.db, 10, "Haystacks", 1);
    painting(&g.db, 11, "Water Lilies", 1);
    let context = g.domain.create_context();
    let monet = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);

    context.delete_object(&monet).unwrap();
    assert_eq!(context.deleted_objects().len(), 3);
    context.commit_changes().unwrap();

    assert_eq!(g.db.row_count("ARTIST"), 0);
    assert_eq!(g.db.row_count("PAINTING"), 0);
    assert_eq!(monet.persistence_state(), PersistenceState::Transient);
    assert_eq!(context.registered_objects_count(), 0);
}

#[test]
fn rollback_discards_every_change() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    let context = g.domain.create_context();
    let monet = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
    monet.write_property("name", "Claude Monet").unwrap();
    let added = context.new_object("Painting").unwrap();
    monet.add_to_many("paintings", &added).unwrap();

    context.rollback_changes().unwrap();

    assert!(!context.has_changes());
    assert_eq!(added.persistence_state(), PersistenceState::Transient);
    assert_eq!(monet.get::<String>("name").unwrap(), "Monet");
    assert!(monet.to_many("paintings").unwrap().is_empty());
    assert!(g.db.batches().is_empty());
}

#[test]
fn many_to_many_add_then_remove_writes_nothing() {
    let g = gallery();
    artist(&g.db, 1, "Monet");
    g.db.insert_row("ARTGROUP", DataRow::new().with("GROUP_ID", 7_i64).with("NAME", "Impressionists"))
        .unwrap();
    let context = g.domain.create_context();
    let monet = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
    let group = context.select(&ObjectSelect::query("ArtGroup")).unwrap().remove(0);

    monet.add_to_many("groups", &group).unwrap();
    monet.remove_from_many("groups", &group).unwrap();
    context.commit_changes().unwrap();
    assert!(g.db.batches().is_empty());

    monet.add_to_many("groups", &group).unwrap();
    context.commit_changes().unwrap();
    assert_eq!(g.db.row_count("ARTIST_GROUP"), 1);
}
