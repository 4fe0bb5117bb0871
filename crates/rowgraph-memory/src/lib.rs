//! In-memory relational store for rowgraph.
//!
//! [`MemoryDatabase`] keeps tables as vectors of rows and implements
//! [`QueryExecutor`](rowgraph_core::QueryExecutor): it evaluates every
//! [`Qualifier`](rowgraph_core::Qualifier) form, expands joint outer joins,
//! applies ordering and limits, and executes DML batches inside an
//! all-or-nothing transaction. Every select and batch is recorded so tests
//! can assert on the statements a session issued.
//!
//! [`SequencePkGenerator`] hands out increasing integer keys.

mod database;
mod eval;
mod pk;
mod transaction;

pub use database::{ForeignKey, MemoryDatabase};
pub use pk::SequencePkGenerator;
pub use transaction::MemoryTransaction;
