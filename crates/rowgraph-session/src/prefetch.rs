//! Prefetch trees: relationships resolved together with the objects of a
//! query instead of one fault at a time.
//!
//! Each node of a [`PrefetchTreeNode`] names a relationship of its parent's
//! entity and how it is fetched:
//!
//! - **Joint**: outer-joined into the parent query; child columns come back
//!   under a `relationship.` prefix.
//! - **Disjoint**: one extra query per level, restricted by repeating the
//!   parent query's qualifier through the relationship's reverse path.
//! - **DisjointById**: one extra query per level, restricted to the keys of
//!   the parent objects actually fetched.
//!
//! Phantom nodes only carry children; their own relationship is fetched to
//! reach the next level but never stored on the parents.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rowgraph_core::{
    ANCHOR_PREFIX, DataRow, EntityInfo, JointJoin, ObjectId, PATH_SEPARATOR, Qualifier, RelationshipInfo, Result,
    RowQuery, Value, pk_for_row,
};
use serde::{Deserialize, Serialize};

use crate::context::ContextInner;
use crate::fault::{merge_members, sort_members};
use crate::object::{ObjectRef, PersistentObject, ToManySlot, ToOneSlot};
use crate::object_store::ObjectStore;
use crate::query::unique;

/// How a prefetched relationship is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefetchSemantics {
    Joint,
    Disjoint,
    #[default]
    DisjointById,
    /// Left to the engine; currently fetched by id.
    Undefined,
}

/// A node of a prefetch tree. The root has no name.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchTreeNode {
    name: Option<String>,
    semantics: PrefetchSemantics,
    phantom: bool,
    children: Vec<PrefetchTreeNode>,
}

impl PrefetchTreeNode {
    pub fn root() -> Self {
        Self {
            name: None,
            semantics: PrefetchSemantics::Undefined,
            phantom: true,
            children: Vec::new(),
        }
    }

    /// Add a dotted relationship path below this node.
    ///
    /// Missing intermediate nodes are created as phantoms with the same
    /// semantics; the last node is made real and takes `semantics`.
    pub fn add_path(&mut self, path: &str, semantics: PrefetchSemantics) -> &mut Self {
        let segments: Vec<&str> = path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return self;
        }
        let mut node = self;
        for segment in segments {
            let at = match node.children.iter().position(|c| c.name.as_deref() == Some(segment)) {
                Some(at) => at,
                None => {
                    node.children.push(PrefetchTreeNode {
                        name: Some(segment.to_string()),
                        semantics,
                        phantom: true,
                        children: Vec::new(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[at];
        }
        node.phantom = false;
        node.semantics = semantics;
        node
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn semantics(&self) -> PrefetchSemantics {
        self.semantics
    }

    /// The semantics actually used for this node.
    pub fn effective_semantics(&self) -> PrefetchSemantics {
        match self.semantics {
            PrefetchSemantics::Undefined => PrefetchSemantics::DisjointById,
            other => other,
        }
    }

    pub fn is_phantom(&self) -> bool {
        self.phantom
    }

    pub fn children(&self) -> &[PrefetchTreeNode] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&PrefetchTreeNode> {
        self.children.iter().find(|c| c.name.as_deref() == Some(name))
    }
}

/// Objects of one tree level, aligned with the rows they were built from.
struct Level {
    entity: Arc<EntityInfo>,
    rows: Vec<DataRow>,
    objects: Vec<ObjectRef>,
    /// Restriction selecting this level's rows, when it can be repeated.
    qualifier: Option<Qualifier>,
    /// `rows` carry the outer-joined columns of joint children.
    joint: bool,
}

/// Children fetched for one relationship, grouped by parent.
struct Fetched {
    level: Level,
    by_parent: HashMap<*const PersistentObject, Vec<ObjectRef>>,
}

fn attach(groups: &mut HashMap<*const PersistentObject, Vec<ObjectRef>>, parent: &ObjectRef, child: &ObjectRef) {
    let members = groups.entry(Arc::as_ptr(parent)).or_default();
    if !members.iter().any(|m| Arc::ptr_eq(m, child)) {
        members.push(Arc::clone(child));
    }
}

/// Parent key echoed into a related row, normalized for lookups.
fn anchor_key(row: &DataRow, columns: &[String]) -> Option<BTreeMap<String, Value>> {
    let mut key = BTreeMap::new();
    for column in columns {
        let value = row.get(&format!("{}{}", ANCHOR_PREFIX, column))?;
        if value.is_null() {
            return None;
        }
        key.insert(column.clone(), value.to_key());
    }
    Some(key)
}

fn normalized(id: &ObjectId) -> BTreeMap<String, Value> {
    id.key_values()
        .iter()
        .map(|(k, v)| (k.clone(), v.to_key()))
        .collect()
}

impl ContextInner {
    /// Outer joins for the contiguous joint nodes below the root.
    pub(crate) fn joint_joins(&self, entity: &EntityInfo, tree: &PrefetchTreeNode) -> Result<Vec<JointJoin>> {
        let mut joins = Vec::new();
        self.collect_joints(entity, tree, "", &mut joins)?;
        Ok(joins)
    }

    fn collect_joints(
        &self,
        entity: &EntityInfo,
        node: &PrefetchTreeNode,
        parent_prefix: &str,
        joins: &mut Vec<JointJoin>,
    ) -> Result<()> {
        for child in node
            .children()
            .iter()
            .filter(|c| c.effective_semantics() == PrefetchSemantics::Joint)
        {
            let Some(name) = child.name() else { continue };
            let rel = self.relationship(entity, name)?;
            let target = self.entity(&rel.target_entity)?;
            let prefix = format!("{}{}{}", parent_prefix, name, PATH_SEPARATOR);
            joins.push(JointJoin {
                parent_prefix: parent_prefix.to_string(),
                prefix: prefix.clone(),
                path: rel.joins.clone(),
            });
            self.collect_joints(&target, child, &prefix, joins)?;
        }
        Ok(())
    }

    /// Resolve the prefetch tree below the objects of a query.
    ///
    /// `aligned` holds one object per entry of `rows`; `qualifier` is the
    /// root query's restriction if it can be repeated.
    pub(crate) fn prefetch_in(
        &self,
        store: &mut ObjectStore,
        entity: &Arc<EntityInfo>,
        tree: &PrefetchTreeNode,
        rows: &[DataRow],
        aligned: &[ObjectRef],
        qualifier: Option<Qualifier>,
        refresh: bool,
    ) -> Result<()> {
        let level = Level {
            entity: Arc::clone(entity),
            rows: rows.to_vec(),
            objects: aligned.to_vec(),
            qualifier,
            joint: true,
        };
        self.prefetch_level(store, &level, tree, refresh)
    }

    fn prefetch_level(
        &self,
        store: &mut ObjectStore,
        level: &Level,
        node: &PrefetchTreeNode,
        refresh: bool,
    ) -> Result<()> {
        for child in node.children() {
            let Some(name) = child.name() else { continue };
            let rel = self.relationship(&level.entity, name)?;
            let target = self.entity(&rel.target_entity)?;
            let semantics = child.effective_semantics();
            let fetched = match semantics {
                PrefetchSemantics::Joint if level.joint => {
                    self.fetch_joint(store, level, &rel, &target, name, refresh)?
                }
                PrefetchSemantics::Disjoint if level.qualifier.is_some() => {
                    self.fetch_disjoint(store, level, &rel, &target, refresh)?
                }
                _ => self.fetch_by_id(store, level, &rel, &target, refresh)?,
            };
            tracing::trace!(
                relationship = name,
                semantics = ?semantics,
                objects = fetched.level.objects.len(),
                "Prefetched relationship"
            );
            if !child.is_phantom() {
                self.connect(store, level, &rel, &fetched.by_parent);
            }
            self.prefetch_level(store, &fetched.level, child, refresh)?;
        }
        Ok(())
    }

    fn child_qualifier(&self, level: &Level, rel: &RelationshipInfo, target: &EntityInfo) -> Option<Qualifier> {
        level.qualifier.as_ref().map(|q| {
            Qualifier::Related {
                path: rel.reversed_path(&level.entity.table),
                anchor: Box::new(q.clone()),
                echo: Vec::new(),
            }
            .and(self.resolver.entity_qualifier(&target.name))
        })
    }

    /// Children carried under `name.` in the parent rows.
    fn fetch_joint(
        &self,
        store: &mut ObjectStore,
        level: &Level,
        rel: &RelationshipInfo,
        target: &Arc<EntityInfo>,
        name: &str,
        refresh: bool,
    ) -> Result<Fetched> {
        let prefix = format!("{}{}", name, PATH_SEPARATOR);
        let mut rows = Vec::new();
        let mut parents = Vec::new();
        for (row, parent) in level.rows.iter().zip(&level.objects) {
            let child_row = row.prefixed_columns(&prefix);
            // an outer join miss leaves the key NULL
            if pk_for_row(target, &child_row).is_none() {
                continue;
            }
            rows.push(child_row);
            parents.push(Arc::clone(parent));
        }
        let roots: Vec<DataRow> = rows.iter().map(DataRow::root_columns).collect();
        let objects = self.objects_from_rows(store, target, &roots, refresh)?;
        let mut by_parent = HashMap::new();
        for (parent, child) in parents.iter().zip(&objects) {
            attach(&mut by_parent, parent, child);
        }
        Ok(Fetched {
            level: Level {
                entity: Arc::clone(target),
                rows,
                objects,
                qualifier: self.child_qualifier(level, rel, target),
                joint: true,
            },
            by_parent,
        })
    }

    /// Children selected by repeating the parent level's qualifier.
    fn fetch_disjoint(
        &self,
        store: &mut ObjectStore,
        level: &Level,
        rel: &RelationshipInfo,
        target: &Arc<EntityInfo>,
        refresh: bool,
    ) -> Result<Fetched> {
        let Some(parent_qualifier) = &level.qualifier else {
            return self.fetch_by_id(store, level, rel, target, refresh);
        };
        let qualifier = Qualifier::Related {
            path: rel.reversed_path(&level.entity.table),
            anchor: Box::new(parent_qualifier.clone()),
            echo: level.entity.pk_columns.clone(),
        }
        .and(self.resolver.entity_qualifier(&target.name));
        let rows = self
            .executor
            .select(&RowQuery::new(target.table.clone(), qualifier))?;
        self.partition_by_anchor(store, level, rel, target, &rows, refresh)
    }

    /// Children selected by the keys of the parent objects.
    fn fetch_by_id(
        &self,
        store: &mut ObjectStore,
        level: &Level,
        rel: &RelationshipInfo,
        target: &Arc<EntityInfo>,
        refresh: bool,
    ) -> Result<Fetched> {
        if rel.owns_foreign_key && !rel.is_flattened() {
            return self.fetch_by_foreign_key(store, level, rel, target, refresh);
        }
        let pk_columns = &level.entity.pk_columns;
        let tuples: Vec<Vec<Value>> = unique(&level.objects)
            .iter()
            .filter_map(|p| p.object_id())
            .filter(|id| !id.is_temporary())
            .map(|id| {
                pk_columns
                    .iter()
                    .map(|c| id.key_value(c).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        if tuples.is_empty() {
            return self.partition_by_anchor(store, level, rel, target, &[], refresh);
        }
        let qualifier = Qualifier::Related {
            path: rel.reversed_path(&level.entity.table),
            anchor: Box::new(Qualifier::In {
                columns: pk_columns.clone(),
                tuples,
            }),
            echo: pk_columns.clone(),
        }
        .and(self.resolver.entity_qualifier(&target.name));
        let rows = self
            .executor
            .select(&RowQuery::new(target.table.clone(), qualifier))?;
        self.partition_by_anchor(store, level, rel, target, &rows, refresh)
    }

    /// Group related rows by the parent key echoed under the anchor prefix.
    fn partition_by_anchor(
        &self,
        store: &mut ObjectStore,
        level: &Level,
        rel: &RelationshipInfo,
        target: &Arc<EntityInfo>,
        rows: &[DataRow],
        refresh: bool,
    ) -> Result<Fetched> {
        let parents: HashMap<BTreeMap<String, Value>, ObjectRef> = level
            .objects
            .iter()
            .filter_map(|p| p.object_id().map(|id| (normalized(&id), Arc::clone(p))))
            .collect();
        let roots: Vec<DataRow> = rows.iter().map(DataRow::root_columns).collect();
        let objects = self.objects_from_rows(store, target, &roots, refresh)?;
        let mut by_parent = HashMap::new();
        for (row, child) in rows.iter().zip(&objects) {
            let parent = anchor_key(row, &level.entity.pk_columns).and_then(|key| parents.get(&key));
            if let Some(parent) = parent {
                attach(&mut by_parent, parent, child);
            }
        }
        Ok(Fetched {
            level: Level {
                entity: Arc::clone(target),
                rows: roots,
                objects,
                qualifier: self.child_qualifier(level, rel, target),
                joint: false,
            },
            by_parent,
        })
    }

    /// Targets of a foreign-key to-one, selected by the key values found in
    /// the parent rows. Parents with a NULL key need no query.
    fn fetch_by_foreign_key(
        &self,
        store: &mut ObjectStore,
        level: &Level,
        rel: &RelationshipInfo,
        target: &Arc<EntityInfo>,
        refresh: bool,
    ) -> Result<Fetched> {
        let columns: Vec<String> = rel
            .first_step()
            .map(|s| s.pairs.iter().map(|p| p.target.clone()).collect())
            .unwrap_or_default();
        let mut wanted = Vec::new();
        let mut tuples: Vec<Vec<Value>> = Vec::new();
        for (row, parent) in level.rows.iter().zip(&level.objects) {
            let Some(id) = self.fk_target_id(rel, row) else {
                continue;
            };
            let key = normalized(&id);
            let tuple: Vec<Value> = columns
                .iter()
                .map(|c| key.get(c).cloned().unwrap_or_default())
                .collect();
            if !tuples.contains(&tuple) {
                tuples.push(tuple);
            }
            wanted.push((Arc::clone(parent), key));
        }

        let mut rows = Vec::new();
        if !tuples.is_empty() {
            let qualifier = Qualifier::In {
                columns: columns.clone(),
                tuples,
            }
            .and(self.resolver.entity_qualifier(&target.name));
            rows = self
                .executor
                .select(&RowQuery::new(target.table.clone(), qualifier))?
                .iter()
                .map(DataRow::root_columns)
                .collect();
        }
        let objects = self.objects_from_rows(store, target, &rows, refresh)?;
        let by_key: HashMap<BTreeMap<String, Value>, ObjectRef> = rows
            .iter()
            .zip(&objects)
            .filter_map(|(row, object)| {
                row.key_for(columns.iter().map(String::as_str))
                    .map(|key| (key, Arc::clone(object)))
            })
            .collect();
        let mut by_parent = HashMap::new();
        for (parent, key) in &wanted {
            if let Some(child) = by_key.get(key) {
                attach(&mut by_parent, parent, child);
            }
        }
        Ok(Fetched {
            level: Level {
                entity: Arc::clone(target),
                rows,
                objects,
                qualifier: self.child_qualifier(level, rel, target),
                joint: false,
            },
            by_parent,
        })
    }

    /// Store fetched children on every parent of the level.
    ///
    /// Lists changed locally and locally set to-ones are left alone; a
    /// faulted list keeps its pending additions and removals.
    fn connect(
        &self,
        store: &ObjectStore,
        level: &Level,
        rel: &RelationshipInfo,
        by_parent: &HashMap<*const PersistentObject, Vec<ObjectRef>>,
    ) {
        let reverse = self
            .resolver
            .reverse_relationship(&level.entity.name, &rel.name)
            .filter(|r| !r.is_to_many())
            .map(|r| r.name.clone());
        for parent in unique(&level.objects) {
            let Some(id) = parent.object_id() else { continue };
            let children = by_parent.get(&Arc::as_ptr(&parent)).cloned().unwrap_or_default();
            let (kept_to_one, touched) = store.diff(&id).map_or((false, false), |d| {
                (
                    d.modified_to_one.contains(&rel.name),
                    d.touched_to_many.contains(&rel.name),
                )
            });

            if rel.is_to_many() {
                let slot = parent.read().to_many.get(&rel.name).cloned();
                let mut members = match slot {
                    Some(ToManySlot::Resolved(_)) if touched => continue,
                    Some(ToManySlot::Fault { added, removed }) => merge_members(children.clone(), &added, &removed),
                    _ => merge_members(children.clone(), &[], &[]),
                };
                if let Some(attribute) = &rel.order_by {
                    sort_members(&mut members, attribute);
                }
                parent
                    .write()
                    .to_many
                    .insert(rel.name.clone(), ToManySlot::Resolved(members));
            } else if !kept_to_one {
                let target = children.first().cloned();
                parent
                    .write()
                    .to_one
                    .insert(rel.name.clone(), ToOneSlot::Resolved(target));
            }

            if let Some(reverse) = &reverse {
                for child in &children {
                    self.set_reverse_fault(store, child, reverse, &parent);
                }
            }
        }
    }

    /// Point a child's faulted reverse to-one at the parent it was fetched for.
    fn set_reverse_fault(&self, store: &ObjectStore, child: &ObjectRef, reverse: &str, parent: &ObjectRef) {
        let Some(id) = child.object_id() else { return };
        if store.diff(&id).is_some_and(|d| d.modified_to_one.contains(reverse)) {
            return;
        }
        let mut data = child.write();
        if matches!(data.to_one.get(reverse), Some(ToOneSlot::Fault)) {
            data.to_one
                .insert(reverse.to_string(), ToOneSlot::Resolved(Some(Arc::clone(parent))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectSelect;
    use crate::testing::{gallery, seed_artists, seed_painting};
    use rowgraph_core::OrderBy;

    fn titles(objects: &[ObjectRef]) -> Vec<String> {
        objects.iter().map(|p| p.get::<String>("title").unwrap()).collect()
    }

    fn seeded() -> crate::testing::Fixture {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet"), (2, "Manet"), (3, "Degas")]);
        seed_painting(&fixture.db, 10, "Water Lilies", Some(1));
        seed_painting(&fixture.db, 11, "Haystacks", Some(1));
        seed_painting(&fixture.db, 12, "Olympia", Some(2));
        seed_painting(&fixture.db, 13, "Unattributed", None);
        fixture
    }

    #[test]
    fn test_add_path_creates_phantom_intermediates() {
        let mut root = PrefetchTreeNode::root();
        root.add_path("paintings.gallery", PrefetchSemantics::Disjoint);
        let paintings = root.child("paintings").unwrap();
        assert!(paintings.is_phantom());
        assert_eq!(paintings.semantics(), PrefetchSemantics::Disjoint);
        let gallery = paintings.child("gallery").unwrap();
        assert!(!gallery.is_phantom());

        root.add_path("paintings", PrefetchSemantics::Joint);
        let paintings = root.child("paintings").unwrap();
        assert!(!paintings.is_phantom());
        assert_eq!(paintings.semantics(), PrefetchSemantics::Joint);
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn test_undefined_semantics_fetch_by_id() {
        let mut root = PrefetchTreeNode::root();
        let node = root.add_path("artist", PrefetchSemantics::Undefined);
        assert_eq!(node.effective_semantics(), PrefetchSemantics::DisjointById);
    }

    #[test]
    fn test_each_semantics_resolves_to_many_without_faults() {
        for semantics in [
            PrefetchSemantics::Joint,
            PrefetchSemantics::Disjoint,
            PrefetchSemantics::DisjointById,
        ] {
            let fixture = seeded();
            let context = fixture.context();
            let artists = context
                .select(
                    &ObjectSelect::query("Artist")
                        .order_by(OrderBy::asc("ARTIST_ID"))
                        .prefetch("paintings", semantics),
                )
                .unwrap();
            assert_eq!(artists.len(), 3, "{semantics:?}");
            let queries = fixture.db.query_count();

            assert!(!artists[0].is_fault("paintings"), "{semantics:?}");
            assert_eq!(titles(&artists[0].to_many("paintings").unwrap()), vec!["Haystacks", "Water Lilies"]);
            assert_eq!(titles(&artists[1].to_many("paintings").unwrap()), vec!["Olympia"]);
            assert!(artists[2].to_many("paintings").unwrap().is_empty());
            assert_eq!(fixture.db.query_count(), queries, "{semantics:?}");

            let painting = &artists[1].to_many("paintings").unwrap()[0];
            assert!(!painting.is_fault("artist"), "{semantics:?}");
        }
    }

    #[test]
    fn test_joint_prefetch_uses_one_query() {
        let fixture = seeded();
        let context = fixture.context();
        context
            .select(&ObjectSelect::query("Artist").prefetch("paintings", PrefetchSemantics::Joint))
            .unwrap();
        assert_eq!(fixture.db.query_count(), 1);
    }

    #[test]
    fn test_to_one_by_id_skips_null_keys() {
        let fixture = seeded();
        let context = fixture.context();
        let paintings = context
            .select(
                &ObjectSelect::query("Painting")
                    .order_by(OrderBy::asc("PAINTING_ID"))
                    .prefetch("artist", PrefetchSemantics::DisjointById),
            )
            .unwrap();
        assert_eq!(fixture.db.query_count(), 2);
        let queries = fixture.db.query_count();
        let artist = paintings[0].to_one("artist").unwrap().unwrap();
        assert_eq!(artist.get::<String>("name").unwrap(), "Monet");
        assert!(paintings[3].to_one("artist").unwrap().is_none());
        assert_eq!(fixture.db.query_count(), queries);
    }

    #[test]
    fn test_phantom_node_is_not_stored() {
        let fixture = seeded();
        fixture
            .db
            .insert_row("GALLERY", DataRow::new().with("GALLERY_ID", 5).with("GALLERY_NAME", "Orsay"))
            .unwrap();
        fixture.db.update_rows(
            "PAINTING",
            &Qualifier::eq("PAINTING_ID", 12),
            &[("GALLERY_ID", Value::from(5_i64))],
        );
        let context = fixture.context();
        let artists = context
            .select(
                &ObjectSelect::query("Artist")
                    .order_by(OrderBy::asc("ARTIST_ID"))
                    .prefetch("paintings.gallery", PrefetchSemantics::DisjointById),
            )
            .unwrap();
        assert!(artists[1].is_fault("paintings"));
        let olympia = artists[1].to_many("paintings").unwrap().remove(0);
        assert!(!olympia.is_fault("gallery"));
        let gallery = olympia.to_one("gallery").unwrap().unwrap();
        assert_eq!(gallery.get::<String>("name").unwrap(), "Orsay");
    }

    #[test]
    fn test_limit_falls_back_to_keys_of_fetched_parents() {
        let fixture = seeded();
        let context = fixture.context();
        let artists = context
            .select(
                &ObjectSelect::query("Artist")
                    .order_by(OrderBy::asc("ARTIST_ID"))
                    .limit(1)
                    .prefetch("paintings", PrefetchSemantics::Disjoint),
            )
            .unwrap();
        assert_eq!(artists.len(), 1);
        assert_eq!(artists[0].to_many("paintings").unwrap().len(), 2);
        // Manet's paintings were not prefetched
        assert_eq!(context.registered_objects_count(), 3);
    }

    #[test]
    fn test_locally_changed_list_is_not_overwritten() {
        let fixture = seeded();
        let context = fixture.context();
        let artist = context
            .object_for_id(&ObjectId::single("Artist", "ARTIST_ID", 3))
            .unwrap()
            .unwrap();
        let painting = context.new_object("Painting").unwrap();
        painting.write_property("title", "Dancers").unwrap();
        artist.add_to_many("paintings", &painting).unwrap();
        assert_eq!(artist.to_many("paintings").unwrap().len(), 1);

        context
            .select(&ObjectSelect::query("Artist").prefetch("paintings", PrefetchSemantics::DisjointById))
            .unwrap();
        assert_eq!(titles(&artist.to_many("paintings").unwrap()), vec!["Dancers"]);
    }
}
