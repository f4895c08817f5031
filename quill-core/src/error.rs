//! Error types for Quill operations

use crate::{EntityKind, ShardId};
use thiserror::Error;

/// Storage layer errors: connection pools, connections and rows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity:?} with id {id}")]
    NotFound { entity: EntityKind, id: i64 },

    #[error("Connection pool {pool} exhausted after waiting {waited_ms}ms")]
    PoolExhausted { pool: String, waited_ms: u64 },

    #[error("Connection pool {pool} is closed")]
    PoolClosed { pool: String },

    #[error("Failed to open connection for pool {pool}: {reason}")]
    ConnectFailed { pool: String, reason: String },

    #[error("Connection broken: {reason}")]
    ConnectionBroken { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Unknown shard {shard}: {shard_count} shards configured")]
    UnknownShard { shard: ShardId, shard_count: usize },

    #[error("Cannot decode column {column}: {reason}")]
    RowDecode { column: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Response cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache loader timed out after {waited_ms}ms")]
    LoadTimeout { waited_ms: u64 },

    #[error("Cache loader aborted before producing a result")]
    LoaderAborted,

    #[error("Failed to render response body: {reason}")]
    Render { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Quill errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuillError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl QuillError {
    /// Whether the caller may retry the operation after backing off.
    ///
    /// Pool exhaustion and loader stalls signal overload rather than a
    /// defect in the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuillError::Storage(StorageError::PoolExhausted { .. })
                | QuillError::Cache(CacheError::LoadTimeout { .. })
        )
    }

    /// Whether the error reports a connection that can no longer be used.
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, QuillError::Storage(StorageError::ConnectionBroken { .. }))
    }
}

/// Result type alias for Quill operations.
pub type QuillResult<T> = Result<T, QuillError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity: EntityKind::Post,
            id: 17,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("Post"));
        assert!(msg.contains("17"));
    }

    #[test]
    fn test_storage_error_display_pool_exhausted() {
        let err = StorageError::PoolExhausted {
            pool: "shard-1".to_string(),
            waited_ms: 250,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("shard-1"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_storage_error_display_unknown_shard() {
        let err = StorageError::UnknownShard {
            shard: ShardId::new(9),
            shard_count: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("shard-9"));
        assert!(msg.contains("4 shards"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "capacity_bytes".to_string(),
            value: "0".to_string(),
            reason: "must be greater than 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("capacity_bytes"));
        assert!(msg.contains("must be greater than 0"));
    }

    #[test]
    fn test_quill_error_from_variants() {
        let storage = QuillError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, QuillError::Storage(_)));

        let cache = QuillError::from(CacheError::LoaderAborted);
        assert!(matches!(cache, QuillError::Cache(_)));

        let config = QuillError::from(ConfigError::MissingRequired {
            field: "shards".to_string(),
        });
        assert!(matches!(config, QuillError::Config(_)));
    }

    #[test]
    fn test_retryable_errors() {
        let exhausted = QuillError::from(StorageError::PoolExhausted {
            pool: "accounts".to_string(),
            waited_ms: 10,
        });
        assert!(exhausted.is_retryable());

        let timeout = QuillError::from(CacheError::LoadTimeout { waited_ms: 10 });
        assert!(timeout.is_retryable());

        let query = QuillError::from(StorageError::QueryFailed {
            reason: "syntax".to_string(),
        });
        assert!(!query.is_retryable());
    }

    #[test]
    fn test_connection_broken_detection() {
        let broken = QuillError::from(StorageError::ConnectionBroken {
            reason: "socket closed".to_string(),
        });
        assert!(broken.is_connection_broken());
        assert!(!broken.is_retryable());
    }
}
