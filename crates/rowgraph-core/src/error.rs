//! Error types for object graph operations.

use std::collections::BTreeMap;
use std::fmt;

use crate::object_id::ObjectId;
use crate::row::DataRow;
use crate::value::Value;

/// The primary error type for all object graph operations.
#[derive(Debug)]
pub enum Error {
    /// An UPDATE or DELETE guarded by lock values affected zero rows
    OptimisticLock(OptimisticLockFailure),
    /// `local_object` was given an object whose id is still temporary
    InvalidPrototypeId(ObjectId),
    /// A relationship fault pointed at a row that no longer exists.
    ///
    /// Raised and consumed inside fault resolution; public operations turn it
    /// into an empty or null relationship value.
    StaleFault { owner: ObjectId, relationship: String },
    /// Commit failed and the database transaction was rolled back
    CommitAborted(CommitError),
    /// Query execution errors reported by the executor
    Query(QueryError),
    /// Unknown entity, attribute or relationship, or inconsistent mapping
    Metadata(MetadataError),
    /// Type conversion errors
    Type(TypeError),
    /// Operation not allowed in the object's lifecycle state
    State(StateError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Details of a failed optimistic lock check.
#[derive(Debug, Clone)]
pub struct OptimisticLockFailure {
    /// Id of the object whose row did not match
    pub object_id: ObjectId,
    /// Column values the statement expected to find (key and lock columns)
    pub expected: BTreeMap<String, Value>,
    /// Statement that missed (`"UPDATE"` or `"DELETE"`)
    pub operation: &'static str,
    /// Table the statement targeted
    pub table: String,
    /// Row as re-read after the failure; `None` when the row was deleted
    pub fresh_snapshot: Option<DataRow>,
}

impl OptimisticLockFailure {
    /// The row as it exists in the database after the failed statement.
    pub fn fresh_snapshot(&self) -> Option<&DataRow> {
        self.fresh_snapshot.as_ref()
    }

    /// True when the conflicting row is gone rather than changed.
    pub fn row_was_deleted(&self) -> bool {
        self.fresh_snapshot.is_none()
    }
}

#[derive(Debug)]
pub struct CommitError {
    pub message: String,
    pub cause: Box<Error>,
}

impl CommitError {
    /// The failure that aborted the commit.
    pub fn cause(&self) -> &Error {
        &self.cause
    }
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub table: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// A to-one lookup returned more than one row
    TooManyRows,
    /// Serialization failure or deadlock (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub object_id: Option<ObjectId>,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Error for an entity name the resolver does not know.
    pub fn unknown_entity(name: &str) -> Self {
        Error::Metadata(MetadataError {
            entity: Some(name.to_string()),
            message: format!("unknown entity '{}'", name),
        })
    }

    /// Error for a property missing from an entity.
    pub fn unknown_property(entity: &str, property: &str) -> Self {
        Error::Metadata(MetadataError {
            entity: Some(entity.to_string()),
            message: format!("entity '{}' has no property '{}'", entity, property),
        })
    }

    pub fn metadata(entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    pub fn state(object_id: Option<ObjectId>, message: impl Into<String>) -> Self {
        Error::State(StateError {
            object_id,
            message: message.into(),
        })
    }

    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            message: message.into(),
            table: None,
            source: None,
        })
    }

    /// Wrap a failure that aborted a commit.
    pub fn commit_aborted(cause: Error) -> Self {
        Error::CommitAborted(CommitError {
            message: cause.to_string(),
            cause: Box::new(cause),
        })
    }

    /// The optimistic lock failure behind this error, looking through
    /// `CommitAborted`.
    pub fn optimistic_lock_failure(&self) -> Option<&OptimisticLockFailure> {
        match self {
            Error::OptimisticLock(f) => Some(f),
            Error::CommitAborted(c) => c.cause.optimistic_lock_failure(),
            _ => None,
        }
    }

    pub fn is_optimistic_lock_failure(&self) -> bool {
        self.optimistic_lock_failure().is_some()
    }

    /// Is this a retryable error?
    ///
    /// Lock conflicts are retryable by the caller after refreshing; they are
    /// never retried internally.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticLock(_) => true,
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Serialization),
            Error::CommitAborted(c) => c.cause.is_retryable(),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OptimisticLock(e) => write!(
                f,
                "Optimistic lock failure: {} on {} for {} matched no rows",
                e.operation, e.table, e.object_id
            ),
            Error::InvalidPrototypeId(id) => {
                write!(f, "Cannot localize object with temporary id {}", id)
            }
            Error::StaleFault {
                owner,
                relationship,
            } => write!(
                f,
                "Relationship '{}' of {} points to a deleted row",
                relationship, owner
            ),
            Error::CommitAborted(e) => write!(f, "Commit aborted: {}", e.message),
            Error::Query(e) => match &e.table {
                Some(table) => write!(f, "Query error on {}: {}", table, e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Metadata(e) => write!(f, "Metadata error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::State(e) => match &e.object_id {
                Some(id) => write!(f, "Invalid state for {}: {}", id, e.message),
                None => write!(f, "Invalid state: {}", e.message),
            },
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::CommitAborted(e) => Some(e.cause.as_ref()),
            Error::Query(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<OptimisticLockFailure> for Error {
    fn from(err: OptimisticLockFailure) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for object graph operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_failure() -> OptimisticLockFailure {
        OptimisticLockFailure {
            object_id: ObjectId::single("Artist", "ARTIST_ID", 1),
            expected: BTreeMap::new(),
            operation: "UPDATE",
            table: "ARTIST".to_string(),
            fresh_snapshot: None,
        }
    }

    #[test]
    fn test_lock_failure_is_visible_through_commit_aborted() {
        let err = Error::commit_aborted(Error::OptimisticLock(lock_failure()));
        assert!(err.is_optimistic_lock_failure());
        assert!(err.is_retryable());
        let failure = err.optimistic_lock_failure().unwrap();
        assert!(failure.row_was_deleted());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::OptimisticLock(lock_failure());
        assert_eq!(
            err.to_string(),
            "Optimistic lock failure: UPDATE on ARTIST for <ObjectId:Artist, ARTIST_ID=1> matched no rows"
        );
        let err = Error::unknown_entity("Nope");
        assert_eq!(err.to_string(), "Metadata error: unknown entity 'Nope'");
    }

    #[test]
    fn test_constraint_error_is_not_retryable() {
        let err = Error::commit_aborted(Error::query(QueryErrorKind::Constraint, "fk"));
        assert!(!err.is_retryable());
        assert!(!err.is_optimistic_lock_failure());
    }
}
