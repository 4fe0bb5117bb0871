//! Entity metadata.
//!
//! An [`EntityInfo`] maps one entity to its table: key columns, attributes,
//! relationships, locking and inheritance. Entities are declared with a
//! builder and resolved into an [`EntityResolver`](crate::EntityResolver).

use serde::{Deserialize, Serialize};

use crate::relationship::RelationshipInfo;
use crate::row::DataRow;
use crate::value::Value;

/// A mapped attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    /// Property name used by the application.
    pub name: String,
    /// Column the attribute is stored in.
    pub column: String,
    /// Compared against its last-read value when updating or deleting.
    pub used_for_locking: bool,
}

/// Locking strategy of an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    #[default]
    None,
    Optimistic,
}

/// How rows of a shared table are assigned to a concrete entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discriminator {
    /// Rows whose `column` equals `value`.
    Value { column: String, value: Value },
    /// Rows where `column` is not NULL.
    NotNull { column: String },
}

impl Discriminator {
    pub fn value(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Discriminator::Value {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Discriminator::NotNull {
            column: column.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Discriminator::Value { column, .. } | Discriminator::NotNull { column } => column,
        }
    }

    pub fn matches(&self, row: &DataRow) -> bool {
        match self {
            Discriminator::Value { column, value } => row
                .get(column)
                .is_some_and(|v| v.sql_eq(value).unwrap_or(false)),
            Discriminator::NotNull { column } => row.get(column).is_some_and(|v| !v.is_null()),
        }
    }
}

/// Metadata for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub name: String,
    /// Table name; subentities inherit their parent's table when empty.
    pub table: String,
    pub pk_columns: Vec<String>,
    pub attributes: Vec<AttributeInfo>,
    pub relationships: Vec<RelationshipInfo>,
    pub lock_type: LockType,
    pub super_entity: Option<String>,
    pub is_abstract: bool,
    pub discriminator: Option<Discriminator>,
}

impl EntityInfo {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            pk_columns: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            lock_type: LockType::None,
            super_entity: None,
            is_abstract: false,
            discriminator: None,
        }
    }

    /// Subentity sharing its parent's table.
    pub fn subentity(name: impl Into<String>, super_entity: impl Into<String>) -> Self {
        let mut info = Self::new(name, "");
        info.super_entity = Some(super_entity.into());
        info
    }

    #[must_use]
    pub fn pk(mut self, column: impl Into<String>) -> Self {
        self.pk_columns.push(column.into());
        self
    }

    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attributes.push(AttributeInfo {
            name: name.into(),
            column: column.into(),
            used_for_locking: false,
        });
        self
    }

    /// Attribute that also takes part in optimistic locking.
    #[must_use]
    pub fn lock_attribute(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attributes.push(AttributeInfo {
            name: name.into(),
            column: column.into(),
            used_for_locking: true,
        });
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    #[must_use]
    pub fn optimistic_locking(mut self) -> Self {
        self.lock_type = LockType::Optimistic;
        self
    }

    #[must_use]
    pub fn abstract_entity(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    #[must_use]
    pub fn discriminator(mut self, discriminator: Discriminator) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    pub fn attribute_info(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_for_column(&self, column: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.column == column)
    }

    pub fn relationship_info(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn is_pk_column(&self, column: &str) -> bool {
        self.pk_columns.iter().any(|c| c == column)
    }

    /// Attributes whose columns are part of the primary key.
    pub fn pk_attributes(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.attributes.iter().filter(|a| self.is_pk_column(&a.column))
    }

    /// To-one relationships whose FK columns live in this entity's row.
    pub fn fk_relationships(&self) -> impl Iterator<Item = &RelationshipInfo> {
        self.relationships.iter().filter(|r| r.owns_foreign_key)
    }

    /// Columns compared in the WHERE clause of updates and deletes under
    /// optimistic locking, excluding the primary key.
    pub fn lock_columns(&self) -> Vec<String> {
        if self.lock_type != LockType::Optimistic {
            return Vec::new();
        }
        let mut columns: Vec<String> = self
            .attributes
            .iter()
            .filter(|a| a.used_for_locking && !self.is_pk_column(&a.column))
            .map(|a| a.column.clone())
            .collect();
        for rel in self.fk_relationships().filter(|r| r.used_for_locking) {
            for column in rel.source_columns() {
                if !columns.iter().any(|c| c == column) && !self.is_pk_column(column) {
                    columns.push(column.to_string());
                }
            }
        }
        columns
    }
}
