//! The in-memory database and its statement log.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use rowgraph_core::{
    BatchOperation, DataRow, Error, ExecutorTransaction, QueryError, QueryErrorKind, QueryExecutor,
    Qualifier, Result, RowQuery, Value,
};

use crate::eval::{self, Tables};
use crate::transaction::MemoryTransaction;

/// A foreign key enforced at statement time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(table: &str, columns: &[&str], referenced_table: &str, referenced_columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            referenced_table: referenced_table.to_string(),
            referenced_columns: referenced_columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Schema {
    /// table -> unique key columns
    pub(crate) keys: HashMap<String, Vec<String>>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Default)]
struct StatementLog {
    queries: Vec<RowQuery>,
    batches: Vec<BatchOperation>,
}

/// Tables held in memory, shared by every session of a test.
///
/// Selects read the committed state. A transaction works on a private copy
/// of the tables and publishes it on commit; transactions are serialized.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    pub(crate) tables: RwLock<Tables>,
    pub(crate) schema: RwLock<Schema>,
    log: Mutex<StatementLog>,
    pub(crate) writer: Mutex<()>,
    failures: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table whose `key_columns` must be unique.
    pub fn create_table(&self, table: &str, key_columns: &[&str]) {
        self.tables.write().entry(table.to_string()).or_default();
        if !key_columns.is_empty() {
            self.schema.write().keys.insert(
                table.to_string(),
                key_columns.iter().map(|c| (*c).to_string()).collect(),
            );
        }
    }

    pub fn add_foreign_key(&self, foreign_key: ForeignKey) {
        self.schema.write().foreign_keys.push(foreign_key);
    }

    /// Insert a row directly, bypassing transactions and the statement log.
    pub fn insert_row(&self, table: &str, row: DataRow) -> Result<()> {
        let mut tables = self.tables.write();
        let schema = self.schema.read();
        check_unique(&tables, &schema, table, &row)?;
        tables.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    /// Change matching rows directly, as another application would.
    pub fn update_rows(&self, table: &str, qualifier: &Qualifier, changes: &[(&str, Value)]) -> usize {
        let mut tables = self.tables.write();
        let snapshot = tables.clone();
        let Some(rows) = tables.get_mut(table) else {
            return 0;
        };
        let mut count = 0;
        for row in rows.iter_mut() {
            if eval::bindings(&snapshot, row, qualifier).is_empty() {
                continue;
            }
            for (column, value) in changes {
                row.insert(*column, value.clone());
            }
            count += 1;
        }
        count
    }

    /// Delete matching rows directly.
    pub fn delete_rows(&self, table: &str, qualifier: &Qualifier) -> usize {
        let mut tables = self.tables.write();
        let snapshot = tables.clone();
        let Some(rows) = tables.get_mut(table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|row| eval::bindings(&snapshot, row, qualifier).is_empty());
        before - rows.len()
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<DataRow> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, Vec::len)
    }

    /// Fail the next batch executed against `table`.
    pub fn fail_next_batch(&self, table: &str) {
        self.failures.lock().push(table.to_string());
    }

    /// Every select run so far.
    pub fn queries(&self) -> Vec<RowQuery> {
        self.log.lock().queries.clone()
    }

    pub fn query_count(&self) -> usize {
        self.log.lock().queries.len()
    }

    /// Every batch executed so far, including rolled-back ones.
    pub fn batches(&self) -> Vec<BatchOperation> {
        self.log.lock().batches.clone()
    }

    pub fn clear_log(&self) {
        let mut log = self.log.lock();
        log.queries.clear();
        log.batches.clear();
    }

    pub(crate) fn record_batch(&self, batch: &BatchOperation) {
        self.log.lock().batches.push(batch.clone());
    }

    pub(crate) fn take_failure(&self, table: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.iter().position(|t| t == table) {
            Some(at) => {
                failures.remove(at);
                true
            }
            None => false,
        }
    }
}

impl QueryExecutor for MemoryDatabase {
    fn select(&self, query: &RowQuery) -> Result<Vec<DataRow>> {
        tracing::trace!(query = %query, "Executing select");
        self.log.lock().queries.push(query.clone());
        let tables = self.tables.read();
        eval::select(&tables, query)
    }

    fn begin(&self) -> Result<Box<dyn ExecutorTransaction + '_>> {
        Ok(Box::new(MemoryTransaction::new(self)))
    }
}

pub(crate) fn constraint(table: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        message,
        table: Some(table.to_string()),
        source: None,
    })
}

pub(crate) fn check_unique(tables: &Tables, schema: &Schema, table: &str, row: &DataRow) -> Result<()> {
    let Some(key) = schema.keys.get(table) else {
        return Ok(());
    };
    let Some(values) = row.key_for(key.iter().map(String::as_str)) else {
        return Err(constraint(table, format!("NULL key value in '{}'", table)));
    };
    let duplicate = tables.get(table).into_iter().flatten().any(|existing| {
        values
            .iter()
            .all(|(column, value)| existing.get(column).is_some_and(|v| v.sql_eq(value) == Some(true)))
    });
    if duplicate {
        return Err(constraint(table, format!("duplicate key {:?} in '{}'", values, table)));
    }
    Ok(())
}

/// Every foreign key held by `row` of `table` must point at an existing row.
pub(crate) fn check_references(tables: &Tables, schema: &Schema, table: &str, row: &DataRow) -> Result<()> {
    for fk in schema.foreign_keys.iter().filter(|fk| fk.table == table) {
        let Some(values) = row.key_for(fk.columns.iter().map(String::as_str)) else {
            continue;
        };
        let found = tables.get(&fk.referenced_table).into_iter().flatten().any(|target| {
            fk.columns.iter().zip(&fk.referenced_columns).all(|(column, referenced)| {
                match (values.get(column), target.get(referenced)) {
                    (Some(a), Some(b)) => a.sql_eq(b) == Some(true),
                    _ => false,
                }
            })
        });
        if !found {
            return Err(constraint(
                table,
                format!(
                    "row of '{}' references missing '{}' row {:?}",
                    table, fk.referenced_table, values
                ),
            ));
        }
    }
    Ok(())
}

/// No row may still reference a row removed from `table`.
pub(crate) fn check_not_referenced(tables: &Tables, schema: &Schema, table: &str, removed: &[DataRow]) -> Result<()> {
    for fk in schema.foreign_keys.iter().filter(|fk| fk.referenced_table == table) {
        for gone in removed {
            let referenced = tables.get(&fk.table).into_iter().flatten().any(|row| {
                fk.columns.iter().zip(&fk.referenced_columns).all(|(column, referenced)| {
                    match (row.get(column), gone.get(referenced)) {
                        (Some(a), Some(b)) => a.sql_eq(b) == Some(true),
                        _ => false,
                    }
                })
            });
            if referenced {
                return Err(constraint(
                    table,
                    format!("row of '{}' is still referenced from '{}'", table, fk.table),
                ));
            }
        }
    }
    Ok(())
}
