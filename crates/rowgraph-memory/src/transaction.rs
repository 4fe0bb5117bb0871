//! All-or-nothing transactions over a private copy of the tables.

use parking_lot::MutexGuard;
use rowgraph_core::{
    BatchOperation, DataRow, Error, ExecutorTransaction, QueryErrorKind, Result, UpdateRow, Value,
};

use crate::database::{self, MemoryDatabase};
use crate::eval::{self, Tables};

/// Open transaction of a [`MemoryDatabase`].
///
/// Holds the database's writer lock until it is committed or rolled back.
pub struct MemoryTransaction<'a> {
    db: &'a MemoryDatabase,
    staged: Tables,
    _writer: MutexGuard<'a, ()>,
}

impl<'a> MemoryTransaction<'a> {
    pub(crate) fn new(db: &'a MemoryDatabase) -> Self {
        let writer = db.writer.lock();
        let staged = db.tables.read().clone();
        Self {
            db,
            staged,
            _writer: writer,
        }
    }

    fn insert(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<Vec<u64>> {
        let db = self.db;
        let schema = db.schema.read();
        let mut counts = Vec::with_capacity(rows.len());
        for values in rows {
            let row = DataRow::from_pairs(columns.iter().cloned().zip(values.iter().cloned()));
            database::check_unique(&self.staged, &schema, table, &row)?;
            database::check_references(&self.staged, &schema, table, &row)?;
            self.staged.entry(table.to_string()).or_default().push(row);
            counts.push(1);
        }
        Ok(counts)
    }

    fn update(
        &mut self,
        table: &str,
        set_columns: &[String],
        where_columns: &[String],
        rows: &[UpdateRow],
    ) -> Result<Vec<u64>> {
        let db = self.db;
        let schema = db.schema.read();
        let mut counts = Vec::with_capacity(rows.len());
        for update in rows {
            let mut changed = Vec::new();
            if let Some(existing) = self.staged.get_mut(table) {
                for row in existing.iter_mut() {
                    if !eval::row_matches(row, where_columns, &update.predicate) {
                        continue;
                    }
                    for (column, value) in set_columns.iter().zip(&update.values) {
                        row.insert(column.clone(), value.clone());
                    }
                    changed.push(row.clone());
                }
            }
            for row in &changed {
                database::check_references(&self.staged, &schema, table, row)?;
            }
            counts.push(changed.len() as u64);
        }
        Ok(counts)
    }

    fn delete(&mut self, table: &str, where_columns: &[String], rows: &[Vec<Value>]) -> Result<Vec<u64>> {
        let db = self.db;
        let schema = db.schema.read();
        let mut counts = Vec::with_capacity(rows.len());
        for predicate in rows {
            let mut removed = Vec::new();
            if let Some(existing) = self.staged.get_mut(table) {
                existing.retain(|row| {
                    if eval::row_matches(row, where_columns, predicate) {
                        removed.push(row.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            database::check_not_referenced(&self.staged, &schema, table, &removed)?;
            counts.push(removed.len() as u64);
        }
        Ok(counts)
    }
}

impl ExecutorTransaction for MemoryTransaction<'_> {
    fn execute(&mut self, batch: &BatchOperation) -> Result<Vec<u64>> {
        tracing::trace!(batch = %batch, "Executing batch");
        self.db.record_batch(batch);
        if self.db.take_failure(batch.table()) {
            return Err(Error::query(
                QueryErrorKind::Database,
                format!("injected failure on table '{}'", batch.table()),
            ));
        }
        match batch {
            BatchOperation::Insert(b) => self.insert(&b.table, &b.columns, &b.rows),
            BatchOperation::Update(b) => self.update(&b.table, &b.set_columns, &b.where_columns, &b.rows),
            BatchOperation::Delete(b) => self.delete(&b.table, &b.where_columns, &b.rows),
        }
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        *this.db.tables.write() = this.staged;
        tracing::debug!("Memory transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        tracing::debug!("Memory transaction rolled back");
        Ok(())
    }
}
