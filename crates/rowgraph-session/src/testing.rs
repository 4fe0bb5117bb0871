//! Shared fixtures for unit tests: a small gallery model over an in-memory
//! database.

use std::sync::Arc;

use rowgraph_core::{
    DataRow, DeleteRule, Discriminator, EntityInfo, EntityResolver, LinkTableInfo, RelationshipInfo,
};
use rowgraph_memory::{ForeignKey, MemoryDatabase, SequencePkGenerator};

use crate::context::DataContext;
use crate::domain::DataDomain;

pub(crate) struct Fixture {
    pub(crate) db: Arc<MemoryDatabase>,
    pub(crate) domain: DataDomain,
}

impl Fixture {
    pub(crate) fn context(&self) -> DataContext {
        self.domain.create_context()
    }
}

pub(crate) fn gallery_entities() -> Vec<EntityInfo> {
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
                    .delete_rule(DeleteRule::Nullify),
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
        EntityInfo::new("Gallery", "GALLERY")
            .pk("GALLERY_ID")
            .attribute("name", "GALLERY_NAME")
            .relationship(
                RelationshipInfo::one_to_many("paintings", "Painting")
                    .join("GALLERY_ID", "GALLERY_ID")
                    .delete_rule(DeleteRule::Deny),
            ),
        EntityInfo::new("Painting", "PAINTING")
            .pk("PAINTING_ID")
            .attribute("title", "PAINTING_TITLE")
            .discriminator(Discriminator::value("KIND", "P"))
            .relationship(RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ARTIST_ID"))
            .relationship(RelationshipInfo::many_to_one("gallery", "Gallery").join("GALLERY_ID", "GALLERY_ID")),
        EntityInfo::subentity("Sketch", "Painting").discriminator(Discriminator::value("KIND", "S")),
        EntityInfo::new("ArtGroup", "ARTGROUP")
            .pk("GROUP_ID")
            .attribute("name", "NAME")
            .relationship(
                RelationshipInfo::many_to_many("artists", "Artist").link_table(LinkTableInfo::new(
                    "ARTIST_GROUP",
                    "GROUP_ID",
                    "GROUP_ID",
                    "ARTIST_ID",
                    "ARTIST_ID",
                )),
            ),
    ]
}

pub(crate) fn gallery_database() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table("ARTIST", &["ARTIST_ID"]);
    db.create_table("GALLERY", &["GALLERY_ID"]);
    db.create_table("PAINTING", &["PAINTING_ID"]);
    db.create_table("ARTGROUP", &["GROUP_ID"]);
    db.create_table("ARTIST_GROUP", &["ARTIST_ID", "GROUP_ID"]);
    db.add_foreign_key(ForeignKey::new("PAINTING", &["ARTIST_ID"], "ARTIST", &["ARTIST_ID"]));
    db.add_foreign_key(ForeignKey::new("PAINTING", &["GALLERY_ID"], "GALLERY", &["GALLERY_ID"]));
    db.add_foreign_key(ForeignKey::new("ARTIST_GROUP", &["ARTIST_ID"], "ARTIST", &["ARTIST_ID"]));
    db.add_foreign_key(ForeignKey::new("ARTIST_GROUP", &["GROUP_ID"], "ARTGROUP", &["GROUP_ID"]));
    db
}

pub(crate) fn gallery() -> Fixture {
    let db = Arc::new(gallery_database());
    let resolver = EntityResolver::new(gallery_entities()).expect("gallery model resolves");
    let domain = DataDomain::new(
        resolver,
        Arc::clone(&db) as Arc<dyn rowgraph_core::QueryExecutor>,
        Arc::new(SequencePkGenerator::new()),
    );
    Fixture { db, domain }
}

pub(crate) fn seed_artists(db: &MemoryDatabase, artists: &[(i64, &str)]) {
    for (id, name) in artists {
        db.insert_row(
            "ARTIST",
            DataRow::new().with("ARTIST_ID", *id).with("ARTIST_NAME", *name),
        )
        .expect("artist row");
    }
}

pub(crate) fn seed_painting(db: &MemoryDatabase, id: i64, title: &str, artist: Option<i64>) {
    let mut row = DataRow::new()
        .with("PAINTING_ID", id)
        .with("PAINTING_TITLE", title)
        .with("KIND", "P");
    if let Some(artist) = artist {
        row.insert("ARTIST_ID", artist);
    }
    db.insert_row("PAINTING", row).expect("painting row");
}
