//! Entity records of the publishing service.
//!
//! Accounts (users and tenants) live in the accounts database; posts and
//! comments live on the tenant's shard.

use crate::{CommentId, PostId, TenantId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub created_at: Timestamp,
}

/// A post published by a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: PostId,
    pub tenant_id: TenantId,
    pub author_id: UserId,
    pub title: String,
    pub body: String,
    pub published: bool,
    pub created_at: Timestamp,
}

/// A comment on a post. Always stored on the same shard as its post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: CommentId,
    pub tenant_id: TenantId,
    pub post_id: PostId,
    pub author_id: UserId,
    pub body: String,
    pub created_at: Timestamp,
}
