//! Core types for the rowgraph object graph engine.
//!
//! This crate provides the vocabulary shared by the snapshot cache and the
//! session layer:
//!
//! - [`Value`] and [`DataRow`] for column values and row snapshots
//! - [`ObjectId`] for temporary and permanent object identity
//! - [`EntityInfo`], [`RelationshipInfo`] and [`EntityResolver`] for mapping
//! - [`RowQuery`], [`Qualifier`] and [`BatchOperation`] for talking to the
//!   database through a [`QueryExecutor`]
//! - [`Error`] and [`Result`]

pub mod batch;
pub mod connection;
pub mod entity;
pub mod error;
pub mod object_id;
pub mod query;
pub mod relationship;
pub mod resolver;
pub mod row;
pub mod value;

pub use batch::{BatchOperation, DeleteBatch, InsertBatch, UpdateBatch, UpdateRow};
pub use connection::{ExecutorTransaction, PkGenerator, QueryExecutor};
pub use entity::{AttributeInfo, Discriminator, EntityInfo, LockType};
pub use error::{
    CommitError, ConfigError, Error, MetadataError, OptimisticLockFailure, QueryError,
    QueryErrorKind, Result, StateError, TypeError,
};
pub use object_id::ObjectId;
pub use query::{ANCHOR_PREFIX, CompareOp, JointJoin, OrderBy, Qualifier, RowQuery};
pub use relationship::{
    ColumnPair, DeleteRule, JoinStep, LinkTableInfo, RelationshipInfo, RelationshipKind,
};
pub use resolver::{EntityResolver, pk_for_row};
pub use row::{DataRow, FromValue, PATH_SEPARATOR};
pub use value::Value;
