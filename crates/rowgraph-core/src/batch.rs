//! DML batches produced by a commit.
//!
//! Rows of one batch share a table and a column layout; each row carries its
//! own values and WHERE values. Predicates compare NULL-aware, so a NULL lock
//! value matches only a NULL column.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRow {
    /// Values for `set_columns`.
    pub values: Vec<Value>,
    /// Values for `where_columns`.
    pub predicate: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub table: String,
    pub set_columns: Vec<String>,
    pub where_columns: Vec<String>,
    pub rows: Vec<UpdateRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteBatch {
    pub table: String,
    pub where_columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// One batched statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOperation {
    Insert(InsertBatch),
    Update(UpdateBatch),
    Delete(DeleteBatch),
}

impl BatchOperation {
    pub fn table(&self) -> &str {
        match self {
            BatchOperation::Insert(b) => &b.table,
            BatchOperation::Update(b) => &b.table,
            BatchOperation::Delete(b) => &b.table,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            BatchOperation::Insert(b) => b.rows.len(),
            BatchOperation::Update(b) => b.rows.len(),
            BatchOperation::Delete(b) => b.rows.len(),
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            BatchOperation::Insert(_) => "INSERT",
            BatchOperation::Update(_) => "UPDATE",
            BatchOperation::Delete(_) => "DELETE",
        }
    }

    /// Statement template with `$n` placeholders, one per row.
    pub fn sql_template(&self) -> String {
        match self {
            BatchOperation::Insert(b) => {
                let placeholders: Vec<String> =
                    (1..=b.columns.len()).map(|i| format!("${}", i)).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    b.table,
                    b.columns.join(", "),
                    placeholders.join(", ")
                )
            }
            BatchOperation::Update(b) => {
                let sets: Vec<String> = b
                    .set_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ${}", c, i + 1))
                    .collect();
                let offset = b.set_columns.len();
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    b.table,
                    sets.join(", "),
                    where_clause(&b.where_columns, offset)
                )
            }
            BatchOperation::Delete(b) => {
                format!("DELETE FROM {} WHERE {}", b.table, where_clause(&b.where_columns, 0))
            }
        }
    }
}

fn where_clause(columns: &[String], offset: usize) -> String {
    let parts: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", c, offset + i + 1))
        .collect();
    parts.join(" AND ")
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}", self.sql_template(), self.row_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_template_numbers_placeholders() {
        let op = BatchOperation::Update(UpdateBatch {
            table: "ARTIST".into(),
            set_columns: vec!["ARTIST_NAME".into()],
            where_columns: vec!["ARTIST_ID".into(), "LOCK_V".into()],
            rows: vec![UpdateRow {
                values: vec![Value::from("v2")],
                predicate: vec![Value::BigInt(1), Value::Int(0)],
            }],
        });
        assert_eq!(
            op.sql_template(),
            "UPDATE ARTIST SET ARTIST_NAME = $1 WHERE ARTIST_ID = $2 AND LOCK_V = $3"
        );
        assert_eq!(op.row_count(), 1);
        assert_eq!(op.kind(), "UPDATE");
    }

    #[test]
    fn test_insert_and_delete_templates() {
        let insert = BatchOperation::Insert(InsertBatch {
            table: "PAINTING".into(),
            columns: vec!["PAINTING_ID".into(), "ARTIST_ID".into()],
            rows: vec![],
        });
        assert_eq!(
            insert.sql_template(),
            "INSERT INTO PAINTING (PAINTING_ID, ARTIST_ID) VALUES ($1, $2)"
        );
        let delete = BatchOperation::Delete(DeleteBatch {
            table: "PAINTING".into(),
            where_columns: vec!["PAINTING_ID".into()],
            rows: vec![vec![Value::BigInt(3)]],
        });
        assert_eq!(delete.to_string(), "DELETE FROM PAINTING WHERE PAINTING_ID = $1 x1");
    }
}
