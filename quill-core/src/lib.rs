//! Quill Core - Entity Types and Errors
//!
//! Pure data structures shared by every Quill crate: identifiers, tenant
//! records and shard routing, rendering enums, health reports and the error
//! taxonomy. No I/O lives here.

pub mod entities;
pub mod enums;
pub mod error;
pub mod health;
pub mod identity;
pub mod tenant;

pub use entities::{Comment, Post, User};
pub use enums::{ContentType, EntityKind, RenderFlags};
pub use error::{CacheError, ConfigError, QuillError, QuillResult, StorageError};
pub use health::{HealthCheck, HealthStatus};
pub use identity::{CommentId, EntityIdType, PostId, ShardId, TenantId, Timestamp, UserId};
pub use tenant::{ShardRouter, Tenant};
