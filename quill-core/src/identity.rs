//! Identity types for Quill entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Common behavior of the numeric entity identifiers.
///
/// Identifiers are `BIGINT` primary keys in the backing store, so they are
/// plain `i64` values wrapped in a newtype per entity to keep a post id from
/// being passed where a tenant id is expected.
pub trait EntityIdType: Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display {
    /// Wrap a raw database id.
    fn new(raw: i64) -> Self;

    /// The raw database id.
    fn as_i64(&self) -> i64;
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl EntityIdType for $name {
            fn new(raw: i64) -> Self {
                Self(raw)
            }

            fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

entity_id!(
    /// Identifier of a tenant (a publication hosted by the service).
    TenantId,
    "tenant"
);
entity_id!(
    /// Identifier of a user account.
    UserId,
    "user"
);
entity_id!(
    /// Identifier of a post.
    PostId,
    "post"
);
entity_id!(
    /// Identifier of a comment.
    CommentId,
    "comment"
);

/// Identifier of a backing-store shard.
///
/// Shard ids index into the list of shard connection pools. A tenant's shard
/// is assigned once at creation and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u16);

impl ShardId {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Position of this shard in a pool list.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}
