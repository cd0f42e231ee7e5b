//! Error types for MEMDB operations

use thiserror::Error;

/// Errors raised by store adapters.
///
/// All variants carry owned strings so the enum stays `Clone`; cloned
/// errors are broadcast to single-flight waiters on the read path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity or pool failure. Retriable.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A per-call deadline elapsed. Retriable by caller policy.
    #[error("store operation timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// DDL or table-shape failure. Fatal for the affected table.
    #[error("schema error on table {table}: {reason}")]
    Schema { table: String, reason: String },

    /// A pass-through predicate query failed.
    #[error("query failed on table {table}: {reason}")]
    Query { table: String, reason: String },
}

impl StoreError {
    /// Whether a retry on a later tick can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Timeout { .. })
    }
}

/// Master error type for MEMDB engine operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemDbError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("engine is stopped")]
    EngineStopped,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl MemDbError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        MemDbError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Result type alias for MEMDB operations.
pub type MemDbResult<T> = Result<T, MemDbError>;

/// Result type alias for store adapter operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(StoreError::Unavailable {
            reason: "connection refused".to_string()
        }
        .is_retriable());
        assert!(StoreError::Timeout { waited_ms: 500 }.is_retriable());
        assert!(!StoreError::Schema {
            table: "users".to_string(),
            reason: "type mismatch".to_string()
        }
        .is_retriable());
        assert!(!StoreError::Query {
            table: "users".to_string(),
            reason: "syntax".to_string()
        }
        .is_retriable());
    }

    #[test]
    fn test_store_error_converts_to_engine_error() {
        let err: MemDbError = StoreError::Unavailable {
            reason: "pool closed".to_string(),
        }
        .into();
        assert!(matches!(err, MemDbError::Store(StoreError::Unavailable { .. })));
    }
}
