//! Relationship metadata.
//!
//! A relationship is a path of joins from the source entity's table to the
//! target entity's table. Direct relationships have a single join step;
//! many-to-many and other flattened relationships pass through one or more
//! intermediate tables. Every step may join on several columns.

use serde::{Deserialize, Serialize};

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// One-to-one: `Artist` has one `Biography`.
    OneToOne,
    /// Many-to-one: many `Painting`s belong to one `Artist`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Artist` has many `Painting`s.
    OneToMany,
    /// Many-to-many: `Artist`s belong to many `ArtGroup`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    pub const fn is_to_many(self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }
}

/// What deleting the source object does to the relationship's targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Leave targets untouched.
    #[default]
    NoAction,
    /// Unset the reverse relationship on every target.
    Nullify,
    /// Delete every target.
    Cascade,
    /// Refuse the delete while targets exist.
    Deny,
}

/// A pair of joined columns: `source` in the step's source table,
/// `target` in the step's target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnPair {
    pub source: String,
    pub target: String,
}

impl ColumnPair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }
}

/// One hop of a join path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStep {
    /// Table this hop arrives at.
    pub target_table: String,
    /// Joined columns, source side first.
    pub pairs: Vec<ColumnPair>,
}

impl JoinStep {
    pub fn new(target_table: impl Into<String>, pairs: Vec<ColumnPair>) -> Self {
        Self {
            target_table: target_table.into(),
            pairs,
        }
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.source.as_str())
    }

    pub fn target_columns(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.target.as_str())
    }
}

/// Link table description for many-to-many relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"ARTIST_GROUP"`).
    pub table_name: String,
    /// Source key column -> link column pairs.
    pub local: Vec<ColumnPair>,
    /// Link column -> target key column pairs.
    pub remote: Vec<ColumnPair>,
}

impl LinkTableInfo {
    /// Single-column link table.
    pub fn new(
        table_name: impl Into<String>,
        local_key: &str,
        local_column: &str,
        remote_column: &str,
        remote_key: &str,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            local: vec![ColumnPair::new(local_key, local_column)],
            remote: vec![ColumnPair::new(remote_column, remote_key)],
        }
    }

    /// Link table joined on compound keys.
    pub fn composite(
        table_name: impl Into<String>,
        local: &[(&str, &str)],
        remote: &[(&str, &str)],
    ) -> Self {
        Self {
            table_name: table_name.into(),
            local: local.iter().map(|(s, t)| ColumnPair::new(*s, *t)).collect(),
            remote: remote.iter().map(|(s, t)| ColumnPair::new(*s, *t)).collect(),
        }
    }
}

/// Metadata about a relationship between two entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship property on the source entity.
    pub name: String,
    /// Target entity name.
    pub target_entity: String,
    pub kind: RelationshipKind,
    /// Join path; the last step's target table is filled in from the target
    /// entity when left empty.
    pub joins: Vec<JoinStep>,
    /// Name of the reverse relationship on the target entity, declared or
    /// synthesized by the resolver.
    pub reverse: Option<String>,
    pub delete_rule: DeleteRule,
    /// Attribute of the target used to order resolved to-many lists.
    pub order_by: Option<String>,
    /// The target's primary key is derived from the source's key.
    pub to_dependent_pk: bool,
    /// FK columns of this relationship take part in optimistic locking.
    pub used_for_locking: bool,
    /// Set by the resolver: the source row holds the foreign key.
    pub owns_foreign_key: bool,
}

impl RelationshipInfo {
    fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationshipKind) -> Self {
        Self {
            name: name.into(),
            target_entity: target.into(),
            kind,
            joins: vec![JoinStep::new("", Vec::new())],
            reverse: None,
            delete_rule: DeleteRule::NoAction,
            order_by: None,
            to_dependent_pk: false,
            used_for_locking: false,
            owns_foreign_key: false,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::ManyToOne)
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::OneToOne)
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::OneToMany)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::ManyToMany)
    }

    /// Add a joined column pair to the final step.
    #[must_use]
    pub fn join(mut self, source_column: &str, target_column: &str) -> Self {
        if let Some(last) = self.joins.last_mut() {
            last.pairs.push(ColumnPair::new(source_column, target_column));
        }
        self
    }

    /// Insert an intermediate hop before the final step.
    #[must_use]
    pub fn through(mut self, table: &str, pairs: &[(&str, &str)]) -> Self {
        let step = JoinStep::new(
            table,
            pairs.iter().map(|(s, t)| ColumnPair::new(*s, *t)).collect(),
        );
        let at = self.joins.len().saturating_sub(1);
        self.joins.insert(at, step);
        self
    }

    /// Route the relationship through a link table.
    #[must_use]
    pub fn link_table(mut self, link: LinkTableInfo) -> Self {
        self.joins = vec![
            JoinStep::new(link.table_name, link.local),
            JoinStep::new("", link.remote),
        ];
        self
    }

    #[must_use]
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    #[must_use]
    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    #[must_use]
    pub fn order_by(mut self, attribute: impl Into<String>) -> Self {
        self.order_by = Some(attribute.into());
        self
    }

    #[must_use]
    pub fn to_dependent_pk(mut self) -> Self {
        self.to_dependent_pk = true;
        self
    }

    #[must_use]
    pub fn used_for_locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }

    pub fn is_to_many(&self) -> bool {
        self.kind.is_to_many()
    }

    /// More than one hop: arcs live in intermediate (link) tables.
    pub fn is_flattened(&self) -> bool {
        self.joins.len() > 1
    }

    /// First hop out of the source table.
    pub fn first_step(&self) -> Option<&JoinStep> {
        self.joins.first()
    }

    /// Source-table columns the relationship joins on.
    pub fn source_columns(&self) -> Vec<&str> {
        self.joins
            .first()
            .map(|s| s.source_columns().collect())
            .unwrap_or_default()
    }

    /// The join path walked from the target table back to the source table.
    pub fn reversed_path(&self, source_table: &str) -> Vec<JoinStep> {
        let n = self.joins.len();
        (0..n)
            .rev()
            .map(|i| {
                let target_table = if i == 0 {
                    source_table.to_string()
                } else {
                    self.joins[i - 1].target_table.clone()
                };
                JoinStep::new(
                    target_table,
                    self.joins[i].pairs.iter().map(ColumnPair::swapped).collect(),
                )
            })
            .collect()
    }

    /// True if `other` (declared on the target entity) walks this
    /// relationship's path backwards.
    pub fn mirrors(&self, other: &RelationshipInfo, source_table: &str) -> bool {
        if self.joins.len() != other.joins.len() {
            return false;
        }
        let reversed = self.reversed_path(source_table);
        reversed.iter().zip(&other.joins).all(|(a, b)| {
            same_pairs(&a.pairs, &b.pairs)
                && (b.target_table.is_empty() || a.target_table == b.target_table)
        })
    }
}

fn same_pairs(a: &[ColumnPair], b: &[ColumnPair]) -> bool {
    a.len() == b.len() && a.iter().all(|p| b.contains(p))
}
