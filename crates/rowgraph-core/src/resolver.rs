//! Entity metadata resolution.
//!
//! [`EntityResolver`] is built once from declared [`EntityInfo`]s. It merges
//! inherited mappings into subentities, links reverse relationships
//! (declared or synthesized from mirrored joins), builds the inheritance
//! dispatch table used to pick a concrete entity per row, and orders tables
//! by foreign-key dependency for commits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::entity::{Discriminator, EntityInfo};
use crate::error::{ConfigError, Error, Result};
use crate::query::Qualifier;
use crate::relationship::{RelationshipInfo, RelationshipKind};
use crate::row::DataRow;
use crate::value::Value;

const NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";
const TABLE_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.]*$";

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex> {
    if let Some(regex) = cell.get() {
        return Ok(regex);
    }
    let regex = Regex::new(pattern).map_err(|e| {
        Error::Config(ConfigError {
            message: format!("invalid name pattern: {}", e),
        })
    })?;
    Ok(cell.get_or_init(|| regex))
}

fn name_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    compiled(&PATTERN, NAME_PATTERN)
}

fn table_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    compiled(&PATTERN, TABLE_PATTERN)
}

fn check_name(entity: &str, kind: &str, name: &str, pattern: &Regex) -> Result<()> {
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(Error::metadata(
            Some(entity),
            format!("invalid {} name '{}' in entity '{}'", kind, name, entity),
        ))
    }
}

/// Resolved, immutable entity metadata shared by every session.
#[derive(Debug)]
pub struct EntityResolver {
    entities: HashMap<String, Arc<EntityInfo>>,
    declaration_order: Vec<String>,
    children: HashMap<String, Vec<String>>,
    /// entity -> concrete entities of its subtree, most specific first
    dispatch: HashMap<String, Vec<(Option<Discriminator>, String)>>,
    table_order: Vec<String>,
}

impl EntityResolver {
    /// Resolve and validate a set of entity declarations.
    pub fn new(declared: Vec<EntityInfo>) -> Result<Self> {
        let declaration_order: Vec<String> = declared.iter().map(|e| e.name.clone()).collect();
        let mut by_name: HashMap<String, EntityInfo> = HashMap::new();
        for entity in declared {
            if by_name.contains_key(&entity.name) {
                return Err(Error::metadata(
                    Some(&entity.name),
                    format!("duplicate entity '{}'", entity.name),
                ));
            }
            by_name.insert(entity.name.clone(), entity);
        }

        let mut resolved: HashMap<String, EntityInfo> = HashMap::new();
        for name in &declaration_order {
            resolve_inheritance(name, &by_name, &mut resolved, &mut Vec::new())?;
        }

        for name in &declaration_order {
            validate_entity(&resolved[name.as_str()])?;
        }

        complete_relationships(&declaration_order, &mut resolved)?;
        link_reverse_relationships(&declaration_order, &mut resolved)?;

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for name in &declaration_order {
            if let Some(parent) = &resolved[name.as_str()].super_entity {
                children.entry(parent.clone()).or_default().push(name.clone());
            }
        }

        let entities: HashMap<String, Arc<EntityInfo>> = resolved
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();

        let mut resolver = Self {
            entities,
            declaration_order,
            children,
            dispatch: HashMap::new(),
            table_order: Vec::new(),
        };
        resolver.build_dispatch();
        resolver.table_order = resolver.compute_table_order();

        tracing::debug!(
            entities = resolver.entities.len(),
            tables = resolver.table_order.len(),
            "Resolved entity metadata"
        );
        Ok(resolver)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityInfo>> {
        self.entities.get(name)
    }

    /// Look up an entity, failing for unknown names.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityInfo>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::unknown_entity(name))
    }

    /// Entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityInfo>> {
        self.declaration_order
            .iter()
            .filter_map(|name| self.entities.get(name))
    }

    pub fn relationship(&self, entity: &str, name: &str) -> Result<&RelationshipInfo> {
        self.entity(entity)?
            .relationship_info(name)
            .ok_or_else(|| Error::unknown_property(entity, name))
    }

    /// The reverse of `entity.name`, if one is declared or was synthesized.
    pub fn reverse_relationship(&self, entity: &str, name: &str) -> Option<&RelationshipInfo> {
        let rel = self.get(entity)?.relationship_info(name)?;
        let reverse = rel.reverse.as_deref()?;
        self.get(&rel.target_entity)?.relationship_info(reverse)
    }

    /// True if `entity` is `ancestor` or inherits from it.
    pub fn is_kind_of(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = Some(entity);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.get(name).and_then(|e| e.super_entity.as_deref());
        }
        false
    }

    pub fn has_subentities(&self, entity: &str) -> bool {
        self.children.get(entity).is_some_and(|c| !c.is_empty())
    }

    /// Top of the inheritance tree containing `entity`.
    pub fn root_entity<'a>(&'a self, entity: &'a str) -> &'a str {
        let mut current = entity;
        while let Some(parent) = self.get(current).and_then(|e| e.super_entity.as_deref()) {
            current = parent;
        }
        current
    }

    /// Pick the concrete entity a row read through `entity` belongs to.
    pub fn leaf_entity(&self, entity: &str, row: &DataRow) -> Result<&Arc<EntityInfo>> {
        let base = self.entity(entity)?;
        let Some(candidates) = self.dispatch.get(entity) else {
            return Ok(base);
        };
        let matched = candidates
            .iter()
            .find(|(rule, _)| rule.as_ref().is_none_or(|r| r.matches(row)));
        match matched {
            Some((_, leaf)) => self.entity(leaf),
            None => Err(Error::metadata(
                Some(entity),
                format!("row matches no concrete subentity of '{}'", entity),
            )),
        }
    }

    /// Columns [`leaf_entity`](Self::leaf_entity) reads to dispatch rows of
    /// `entity`.
    pub fn discriminator_columns(&self, entity: &str) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for (rule, _) in self.dispatch.get(entity).into_iter().flatten() {
            if let Some(column) = rule.as_ref().map(Discriminator::column) {
                if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                }
            }
        }
        columns
    }

    /// Restriction selecting only rows of `entity` and its subentities from
    /// a table shared with other entities.
    pub fn entity_qualifier(&self, entity: &str) -> Qualifier {
        let Some(info) = self.get(entity) else {
            return Qualifier::All;
        };
        let shared = self
            .entities
            .values()
            .any(|e| e.table == info.table && !self.is_kind_of(&e.name, entity));
        if !shared {
            return Qualifier::All;
        }
        let concrete: Vec<&(Option<Discriminator>, String)> = match self.dispatch.get(entity) {
            Some(list) => list.iter().collect(),
            None => return discriminator_qualifier(info.discriminator.as_ref()),
        };
        if concrete.iter().any(|(rule, _)| rule.is_none()) {
            return Qualifier::All;
        }
        let rules: Vec<&Discriminator> = concrete.iter().filter_map(|(r, _)| r.as_ref()).collect();
        if let Some(column) = common_value_column(&rules) {
            let tuples = rules
                .iter()
                .filter_map(|r| match r {
                    Discriminator::Value { value, .. } => Some(vec![value.clone()]),
                    Discriminator::NotNull { .. } => None,
                })
                .collect();
            return Qualifier::In {
                columns: vec![column.to_string()],
                tuples,
            };
        }
        Qualifier::Or(
            rules
                .into_iter()
                .map(|r| discriminator_qualifier(Some(r)))
                .collect(),
        )
    }

    /// Tables in insert order: referenced tables before referencing ones.
    pub fn table_order(&self) -> &[String] {
        &self.table_order
    }

    /// Position of `table` in [`table_order`](Self::table_order); unknown
    /// tables sort last.
    pub fn table_rank(&self, table: &str) -> usize {
        self.table_order
            .iter()
            .position(|t| t == table)
            .unwrap_or(self.table_order.len())
    }

    fn build_dispatch(&mut self) {
        let names: Vec<String> = self.declaration_order.clone();
        for name in names {
            if !self.has_subentities(&name) {
                continue;
            }
            let mut subtree = Vec::new();
            self.collect_concrete(&name, 0, &mut subtree);
            // entities without a rule act as fallback; deeper entities first
            subtree.sort_by(|a, b| {
                a.1.discriminator
                    .is_none()
                    .cmp(&b.1.discriminator.is_none())
                    .then_with(|| b.0.cmp(&a.0))
            });
            let list = subtree
                .into_iter()
                .map(|(_, e)| (e.discriminator.clone(), e.name.clone()))
                .collect();
            self.dispatch.insert(name, list);
        }
    }

    fn collect_concrete(&self, name: &str, depth: usize, out: &mut Vec<(usize, Arc<EntityInfo>)>) {
        if let Some(info) = self.entities.get(name) {
            if !info.is_abstract {
                out.push((depth, Arc::clone(info)));
            }
        }
        if let Some(kids) = self.children.get(name) {
            for kid in kids {
                self.collect_concrete(kid, depth + 1, out);
            }
        }
    }

    fn compute_table_order(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
        let add_table = |t: &str, tables: &mut Vec<String>| {
            if !tables.iter().any(|x| x == t) {
                tables.push(t.to_string());
            }
        };

        for entity in self.entities() {
            add_table(&entity.table, &mut tables);
            for rel in &entity.relationships {
                let Some(target) = self.get(&rel.target_entity) else {
                    continue;
                };
                if rel.owns_foreign_key && target.table != entity.table {
                    deps.entry(entity.table.clone())
                        .or_default()
                        .insert(target.table.clone());
                }
                if rel.to_dependent_pk && target.table != entity.table {
                    deps.entry(target.table.clone())
                        .or_default()
                        .insert(entity.table.clone());
                }
                if rel.kind == RelationshipKind::ManyToMany && rel.joins.len() == 2 {
                    let link = rel.joins[0].target_table.clone();
                    add_table(&link, &mut tables);
                    let link_deps = deps.entry(link).or_default();
                    link_deps.insert(entity.table.clone());
                    link_deps.insert(target.table.clone());
                }
            }
        }

        // Kahn's algorithm, stable with respect to declaration order
        let mut ordered: Vec<String> = Vec::new();
        let mut remaining = tables;
        loop {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|t| {
                    deps.get(t.as_str())
                        .is_none_or(|d| d.iter().all(|dep| ordered.contains(dep) || dep == *t))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            remaining.retain(|t| !ready.contains(t));
            ordered.extend(ready);
        }
        if !remaining.is_empty() {
            tracing::warn!(
                tables = ?remaining,
                "Foreign key cycle between tables; ordering them by declaration"
            );
            ordered.extend(remaining);
        }
        ordered
    }
}

fn discriminator_qualifier(rule: Option<&Discriminator>) -> Qualifier {
    match rule {
        Some(Discriminator::Value { column, value }) => Qualifier::eq(column.clone(), value.clone()),
        Some(Discriminator::NotNull { column }) => Qualifier::NotNull(column.clone()),
        None => Qualifier::All,
    }
}

fn common_value_column<'a>(rules: &[&'a Discriminator]) -> Option<&'a str> {
    let first = rules.first()?.column();
    rules
        .iter()
        .all(|r| matches!(r, Discriminator::Value { column, .. } if column == first))
        .then_some(first)
}

fn resolve_inheritance(
    name: &str,
    declared: &HashMap<String, EntityInfo>,
    resolved: &mut HashMap<String, EntityInfo>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(name) {
        return Ok(());
    }
    if visiting.iter().any(|v| v == name) {
        visiting.push(name.to_string());
        return Err(Error::metadata(
            Some(name),
            format!("inheritance cycle: {}", visiting.join(" -> ")),
        ));
    }
    let entity = declared.get(name).ok_or_else(|| Error::unknown_entity(name))?;
    let mut merged = entity.clone();

    if let Some(parent_name) = &entity.super_entity {
        if !declared.contains_key(parent_name) {
            return Err(Error::metadata(
                Some(name),
                format!("super entity '{}' of '{}' is not declared", parent_name, name),
            ));
        }
        visiting.push(name.to_string());
        resolve_inheritance(parent_name, declared, resolved, visiting)?;
        visiting.pop();
        let parent = &resolved[parent_name.as_str()];

        if merged.table.is_empty() {
            merged.table = parent.table.clone();
        }
        if merged.pk_columns.is_empty() {
            merged.pk_columns = parent.pk_columns.clone();
        }
        let own_attributes = std::mem::take(&mut merged.attributes);
        merged.attributes = parent.attributes.clone();
        for attr in own_attributes {
            merged.attributes.retain(|a| a.name != attr.name);
            merged.attributes.push(attr);
        }
        let own_relationships = std::mem::take(&mut merged.relationships);
        merged.relationships = parent.relationships.clone();
        for rel in own_relationships {
            merged.relationships.retain(|r| r.name != rel.name);
            merged.relationships.push(rel);
        }
        if merged.lock_type == crate::entity::LockType::None {
            merged.lock_type = parent.lock_type;
        }
    }

    resolved.insert(name.to_string(), merged);
    Ok(())
}

fn validate_entity(entity: &EntityInfo) -> Result<()> {
    let name = entity.name.as_str();
    check_name(name, "entity", name, name_pattern()?)?;
    check_name(name, "table", &entity.table, table_pattern()?)?;
    if entity.pk_columns.is_empty() {
        return Err(Error::metadata(
            Some(name),
            format!("entity '{}' has no primary key columns", name),
        ));
    }
    let mut seen = HashSet::new();
    for column in &entity.pk_columns {
        check_name(name, "column", column, name_pattern()?)?;
    }
    for attr in &entity.attributes {
        check_name(name, "attribute", &attr.name, name_pattern()?)?;
        check_name(name, "column", &attr.column, name_pattern()?)?;
        if !seen.insert(attr.name.as_str()) {
            return Err(Error::metadata(
                Some(name),
                format!("duplicate property '{}' in '{}'", attr.name, name),
            ));
        }
    }
    for rel in &entity.relationships {
        check_name(name, "relationship", &rel.name, name_pattern()?)?;
        if !seen.insert(rel.name.as_str()) {
            return Err(Error::metadata(
                Some(name),
                format!("duplicate property '{}' in '{}'", rel.name, name),
            ));
        }
        for step in &rel.joins {
            if step.pairs.is_empty() {
                return Err(Error::metadata(
                    Some(name),
                    format!("relationship '{}.{}' has a join without columns", name, rel.name),
                ));
            }
            for pair in &step.pairs {
                check_name(name, "column", &pair.source, name_pattern()?)?;
                check_name(name, "column", &pair.target, name_pattern()?)?;
            }
        }
        if rel.kind == RelationshipKind::ManyToMany && !rel.is_flattened() {
            return Err(Error::metadata(
                Some(name),
                format!("many-to-many '{}.{}' needs a link table", name, rel.name),
            ));
        }
    }
    Ok(())
}

fn complete_relationships(order: &[String], resolved: &mut HashMap<String, EntityInfo>) -> Result<()> {
    let tables: HashMap<String, (String, Vec<String>)> = resolved
        .iter()
        .map(|(k, v)| (k.clone(), (v.table.clone(), v.pk_columns.clone())))
        .collect();
    for name in order {
        let Some(entity) = resolved.get_mut(name) else {
            continue;
        };
        for rel in &mut entity.relationships {
            let (target_table, target_pk) = tables.get(&rel.target_entity).ok_or_else(|| {
                Error::metadata(
                    Some(name),
                    format!(
                        "relationship '{}.{}' targets unknown entity '{}'",
                        name, rel.name, rel.target_entity
                    ),
                )
            })?;
            let steps = rel.joins.len();
            for (i, step) in rel.joins.iter_mut().enumerate() {
                if step.target_table.is_empty() {
                    if i + 1 == steps {
                        step.target_table = target_table.clone();
                    } else {
                        return Err(Error::metadata(
                            Some(name),
                            format!("relationship '{}.{}' has a hop without a table", name, rel.name),
                        ));
                    }
                }
            }
            rel.owns_foreign_key = !rel.is_to_many()
                && !rel.is_flattened()
                && !rel.to_dependent_pk
                && rel.joins.first().is_some_and(|step| {
                    step.pairs.len() == target_pk.len()
                        && step.target_columns().all(|c| target_pk.iter().any(|pk| pk == c))
                });
        }
    }
    Ok(())
}

fn link_reverse_relationships(order: &[String], resolved: &mut HashMap<String, EntityInfo>) -> Result<()> {
    let snapshot: HashMap<String, EntityInfo> = resolved.clone();
    let lineage = |entity: &str, other: &str| -> bool {
        is_kind_of_in(&snapshot, entity, other) || is_kind_of_in(&snapshot, other, entity)
    };

    for name in order {
        let Some(entity) = resolved.get_mut(name) else {
            continue;
        };
        let source_table = entity.table.clone();
        for rel in &mut entity.relationships {
            let Some(target) = snapshot.get(&rel.target_entity) else {
                continue;
            };
            match &rel.reverse {
                Some(reverse) => {
                    let back = target.relationship_info(reverse).ok_or_else(|| {
                        Error::metadata(
                            Some(name),
                            format!(
                                "reverse '{}' of '{}.{}' not found in '{}'",
                                reverse, name, rel.name, target.name
                            ),
                        )
                    })?;
                    if !lineage(name, &back.target_entity) {
                        return Err(Error::metadata(
                            Some(name),
                            format!(
                                "reverse '{}.{}' points to '{}', not '{}'",
                                target.name, reverse, back.target_entity, name
                            ),
                        ));
                    }
                }
                None => {
                    let synthesized = target
                        .relationships
                        .iter()
                        .find(|back| lineage(name, &back.target_entity) && rel.mirrors(back, &source_table))
                        .map(|back| back.name.clone());
                    if let Some(back) = synthesized {
                        tracing::trace!(
                            entity = %name,
                            relationship = %rel.name,
                            reverse = %back,
                            "Synthesized reverse relationship"
                        );
                        rel.reverse = Some(back);
                    }
                }
            }
        }
    }
    Ok(())
}

fn is_kind_of_in(entities: &HashMap<String, EntityInfo>, entity: &str, ancestor: &str) -> bool {
    let mut current = Some(entity);
    while let Some(name) = current {
        if name == ancestor {
            return true;
        }
        current = entities.get(name).and_then(|e| e.super_entity.as_deref());
    }
    false
}

/// Key of `row` under the entity's primary key, or `None` when a key column
/// is missing or NULL.
pub fn pk_for_row(entity: &EntityInfo, row: &DataRow) -> Option<std::collections::BTreeMap<String, Value>> {
    row.key_for(entity.pk_columns.iter().map(String::as_str))
}
