//! Gallery model over an in-memory database, shared by the integration
//! tests.

#![allow(dead_code)]

use std::sync::Arc;

use rowgraph::{
    ContextConfig, DataDomain, DataRow, DeleteRule, Discriminator, EntityInfo, EntityResolver, ForeignKey,
    LinkTableInfo, MemoryDatabase, RelationshipInfo, SequencePkGenerator, SnapshotStoreConfig,
};

pub struct Gallery {
    pub db: Arc<MemoryDatabase>,
    pub domain: DataDomain,
}

pub fn entities() -> Vec<EntityInfo> {
    vec![
        EntityInfo::new("Artist", "ARTIST")
            .pk("ARTIST_ID")
            .lock_attribute("name", "ARTIST_NAME")
            .attribute("dateOfBirth", "DATE_OF_BIRTH")
            .optimistic_locking()
            .relationship(
                RelationshipInfo::one_to_many("paintings", "Painting")
                    .join("ARTIST_ID", "ARTIST_ID")
                    .order_by("title")
                    .delete_rule(DeleteRule::Cascade),
            )
            .relationship(
                RelationshipInfo::many_to_many("groups", "ArtGroup").link_table(LinkTableInfo::new(
                    "ARTIST_GROUP",
                    "ARTIST_ID",
                    "ARTIST_ID",
                    "GROUP_ID",
                    "GROUP_ID",
                )),
            ),
        EntityInfo::new("Painting", "PAINTING")
            .pk("PAINTING_ID")
            .attribute("title", "PAINTING_TITLE")
            .discriminator(Discriminator::value("KIND", "P"))
            .relationship(RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ARTIST_ID")),
        EntityInfo::subentity("Sketch", "Painting").discriminator(Discriminator::value("KIND", "S")),
        EntityInfo::new("ArtGroup", "ARTGROUP").pk("GROUP_ID").attribute("name", "NAME"),
    ]
}

pub fn database() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table("ARTIST", &["ARTIST_ID"]);
    db.create_table("PAINTING", &["PAINTING_ID"]);
    db.create_table("ARTGROUP", &["GROUP_ID"]);
    db.create_table("ARTIST_GROUP", &["ARTIST_ID", "GROUP_ID"]);
    db.add_foreign_key(ForeignKey::new("PAINTING", &["ARTIST_ID"], "ARTIST", &["ARTIST_ID"]));
    db.add_foreign_key(ForeignKey::new("ARTIST_GROUP", &["ARTIST_ID"], "ARTIST", &["ARTIST_ID"]));
    db.add_foreign_key(ForeignKey::new("ARTIST_GROUP", &["GROUP_ID"], "ARTGROUP", &["GROUP_ID"]));
    db
}

pub fn gallery() -> Gallery {
    gallery_with_cache(SnapshotStoreConfig::default())
}

pub fn gallery_with_cache(cache: SnapshotStoreConfig) -> Gallery {
    let db = Arc::new(database());
    let resolver = EntityResolver::new(entities()).expect("gallery model resolves");
    let domain = DataDomain::new(
        resolver,
        Arc::clone(&db) as Arc<dyn rowgraph::QueryExecutor>,
        Arc::new(SequencePkGenerator::new()),
    )
    .with_cache_config(cache)
    .with_context_config(ContextConfig::default());
    Gallery { db, domain }
}

pub fn artist(db: &MemoryDatabase, id: i64, name: &str) {
    db.insert_row("ARTIST", DataRow::new().with("ARTIST_ID", id).with("ARTIST_NAME", name))
        .expect("artist row");
}

pub fn painting(db: &MemoryDatabase, id: i64, title: &str, artist: i64) {
    db.insert_row(
        "PAINTING",
        DataRow::new()
            .with("PAINTING_ID", id)
            .with("PAINTING_TITLE", title)
            .with("KIND", "P")
            .with("ARTIST_ID", artist),
    )
    .expect("painting row");
}
