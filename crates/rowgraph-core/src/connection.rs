//! Collaborator traits implemented outside the graph engine.
//!
//! - [`QueryExecutor`] - runs translated selects and opens transactions
//! - [`ExecutorTransaction`] - executes DML batches atomically
//! - [`PkGenerator`] - supplies permanent primary keys for new rows

use crate::batch::BatchOperation;
use crate::entity::EntityInfo;
use crate::error::Result;
use crate::query::RowQuery;
use crate::row::DataRow;
use crate::value::Value;

/// Executes row queries and DML against the relational store.
///
/// Implementations own SQL generation and driver interaction. They must be
/// shareable across sessions running on different threads.
pub trait QueryExecutor: Send + Sync {
    /// Run a select and return flat rows.
    fn select(&self, query: &RowQuery) -> Result<Vec<DataRow>>;

    /// Open a transaction for a commit.
    fn begin(&self) -> Result<Box<dyn ExecutorTransaction + '_>>;
}

/// A database transaction used by one commit.
pub trait ExecutorTransaction {
    /// Execute one batch; returns the affected-row count of every row in
    /// batch order.
    fn execute(&mut self, batch: &BatchOperation) -> Result<Vec<u64>>;

    /// Commit the transaction.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back, discarding every executed batch.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Source of permanent primary-key values.
pub trait PkGenerator: Send + Sync {
    /// Produce a value for `column` of a new row of `entity`.
    fn generate(&self, entity: &EntityInfo, column: &str) -> Result<Value>;
}
