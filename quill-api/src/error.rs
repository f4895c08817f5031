//! Error Types for the Quill API
//!
//! [`ApiError`] is what a handler hands back to the transport: an
//! [`ErrorCode`] with its HTTP status, a message and optional details.
//! Storage, cache and configuration failures convert into it through
//! `From<QuillError>`.

use quill_core::{CacheError, ConfigError, EntityKind, QuillError, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested tenant does not exist
    TenantNotFound,

    /// Requested post does not exist
    PostNotFound,

    /// Requested user does not exist
    UserNotFound,

    /// Requested entity does not exist
    EntityNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Entity with the same identifier already exists
    EntityAlreadyExists,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Database operation failed
    DatabaseError,

    /// Service is temporarily unavailable
    ServiceUnavailable,

    /// Database connection pool exhausted
    ConnectionPoolExhausted,

    /// Operation timed out
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::InvalidInput => 400,

            ErrorCode::TenantNotFound
            | ErrorCode::PostNotFound
            | ErrorCode::UserNotFound
            | ErrorCode::EntityNotFound => 404,

            ErrorCode::EntityAlreadyExists => 409,

            ErrorCode::ServiceUnavailable | ErrorCode::ConnectionPoolExhausted => 503,

            ErrorCode::Timeout => 504,

            ErrorCode::InternalError | ErrorCode::DatabaseError => 500,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::TenantNotFound => "Tenant not found",
            ErrorCode::PostNotFound => "Post not found",
            ErrorCode::UserNotFound => "User not found",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::EntityAlreadyExists => "Entity already exists",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::ConnectionPoolExhausted => "Connection pool exhausted",
            ErrorCode::Timeout => "Operation timed out",
        }
    }

    /// Whether a client may retry the request after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionPoolExhausted | ErrorCode::ServiceUnavailable | ErrorCode::Timeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        self.code.status_code()
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn tenant_not_found(slug: &str) -> Self {
        Self::new(ErrorCode::TenantNotFound, format!("Tenant '{}' not found", slug))
    }

    pub fn post_not_found(post_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::PostNotFound, format!("Post {} not found", post_id))
    }

    pub fn user_not_found(user_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UserNotFound, format!("User {} not found", user_id))
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::EntityAlreadyExists, what)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn connection_pool_exhausted() -> Self {
        Self::from_code(ErrorCode::ConnectionPoolExhausted)
    }
}

/// Convert from QuillError to ApiError.
impl From<QuillError> for ApiError {
    fn from(err: QuillError) -> Self {
        match err {
            QuillError::Storage(StorageError::NotFound { entity, id }) => match entity {
                EntityKind::Post => ApiError::post_not_found(id),
                EntityKind::User => ApiError::user_not_found(id),
                _ => ApiError::new(ErrorCode::EntityNotFound, format!("{} {} not found", entity, id)),
            },
            QuillError::Storage(StorageError::PoolExhausted { pool, waited_ms }) => {
                tracing::warn!(pool = %pool, waited_ms, "Request rejected: connection pool exhausted");
                ApiError::connection_pool_exhausted().with_details(serde_json::json!({
                    "pool": pool,
                    "waited_ms": waited_ms,
                }))
            }
            QuillError::Storage(StorageError::PoolClosed { .. })
            | QuillError::Storage(StorageError::ConnectFailed { .. }) => {
                tracing::error!(error = %err, "Database unavailable");
                ApiError::new(ErrorCode::ServiceUnavailable, "Database is unavailable")
            }
            QuillError::Storage(
                StorageError::ConnectionBroken { .. }
                | StorageError::QueryFailed { .. }
                | StorageError::RowDecode { .. },
            ) => {
                tracing::error!(error = %err, "Database operation failed");
                ApiError::from_code(ErrorCode::DatabaseError)
            }
            QuillError::Storage(StorageError::UnknownShard { .. })
            | QuillError::Storage(StorageError::LockPoisoned)
            | QuillError::Cache(CacheError::LoaderAborted)
            | QuillError::Cache(CacheError::Render { .. }) => {
                tracing::error!(error = %err, "Internal error");
                ApiError::from_code(ErrorCode::InternalError)
            }
            QuillError::Cache(CacheError::LoadTimeout { waited_ms }) => {
                ApiError::from_code(ErrorCode::Timeout).with_details(serde_json::json!({
                    "waited_ms": waited_ms,
                }))
            }
            QuillError::Config(ConfigError::MissingRequired { .. })
            | QuillError::Config(ConfigError::InvalidValue { .. }) => {
                tracing::error!(error = %err, "Configuration error");
                ApiError::internal_error(err.to_string())
            }
        }
    }
}

/// Convert from serde_json::Error to ApiError.
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON serialization error: {:?}", err);
        ApiError::internal_error(format!("Serialization failed: {}", err))
    }
}

/// Convert from std::io::Error to ApiError (render buffer writes).
impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::internal_error(format!("Render failed: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ShardId;

    #[test]
    fn test_pool_exhaustion_is_503_and_retryable() {
        let err = ApiError::from(QuillError::Storage(StorageError::PoolExhausted {
            pool: "shard-0".to_string(),
            waited_ms: 5000,
        }));
        assert_eq!(err.code, ErrorCode::ConnectionPoolExhausted);
        assert_eq!(err.status_code(), 503);
        assert!(err.code.is_retryable());
        assert_eq!(err.details.unwrap()["pool"], "shard-0");
    }

    #[test]
    fn test_not_found_mapping() {
        let err = ApiError::from(QuillError::Storage(StorageError::NotFound {
            entity: EntityKind::Post,
            id: 9,
        }));
        assert_eq!(err.code, ErrorCode::PostNotFound);
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_load_timeout_is_504() {
        let err = ApiError::from(QuillError::Cache(CacheError::LoadTimeout { waited_ms: 10 }));
        assert_eq!(err.status_code(), 504);
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = ApiError::from(QuillError::Storage(StorageError::UnknownShard {
            shard: ShardId::new(4),
            shard_count: 2,
        }));
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "Internal server error");
    }

    #[test]
    fn test_error_serialization() {
        let err = ApiError::tenant_not_found("ghost");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TENANT_NOT_FOUND");
        assert!(json.get("details").is_none());
        assert_eq!(err.to_string(), "TenantNotFound: Tenant 'ghost' not found");
    }
}
