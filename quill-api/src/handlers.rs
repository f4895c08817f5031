//! Request handlers.
//!
//! Read handlers resolve the tenant, derive a [`CacheKey`] from every
//! parameter that changes the rendered bytes and call
//! [`ResponseCache::fetch`](quill_storage::ResponseCache::fetch). On a miss
//! the loader borrows a connection to the tenant's shard, reads the rows,
//! releases the connection, renders into a pooled buffer and hands the
//! copied body to the cache.
//!
//! Write handlers insert on the tenant's shard and then drop every cached
//! response of that tenant.
//!
//! Tables: `tenants` and `users` in the accounts database; `posts` and
//! `comments` on each shard.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use deadpool::managed::Manager;
use quill_core::{
    Comment, CommentId, EntityIdType, EntityKind, Post, PostId, QuillResult, RenderFlags, ShardId,
    StorageError, Tenant, TenantId, User, UserId,
};
use quill_storage::{
    BufferPool, CacheEntry, CacheHandle, CacheKey, Connection, PoolTarget, PooledConnection, ResponseKind,
    Row, ShardedPools, SqlValue,
};
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::render;
use crate::state::AppState;

const TENANT_COLUMNS: &str = "tenant_id, slug, shard_id, created_at";
const USER_COLUMNS: &str = "user_id, username, display_name, created_at";
const POST_COLUMNS: &str = "post_id, tenant_id, author_id, title, body, published, created_at";
const COMMENT_COLUMNS: &str = "comment_id, tenant_id, post_id, author_id, body, created_at";

// ============================================================================
// ROW DECODING
// ============================================================================

fn shard_from_row(row: &Row) -> QuillResult<ShardId> {
    let raw = row.get_i64("shard_id")?;
    u16::try_from(raw).map(ShardId::new).map_err(|_| {
        StorageError::RowDecode {
            column: "shard_id".to_string(),
            reason: format!("{} is not a shard id", raw),
        }
        .into()
    })
}

fn tenant_from_row(row: &Row) -> QuillResult<Tenant> {
    Ok(Tenant {
        tenant_id: TenantId::new(row.get_i64("tenant_id")?),
        slug: row.get_str("slug")?.to_string(),
        shard_id: shard_from_row(row)?,
        created_at: row.get_timestamp("created_at")?,
    })
}

fn user_from_row(row: &Row) -> QuillResult<User> {
    Ok(User {
        user_id: UserId::new(row.get_i64("user_id")?),
        username: row.get_str("username")?.to_string(),
        display_name: row.get_str("display_name")?.to_string(),
        created_at: row.get_timestamp("created_at")?,
    })
}

fn post_from_row(row: &Row) -> QuillResult<Post> {
    Ok(Post {
        post_id: PostId::new(row.get_i64("post_id")?),
        tenant_id: TenantId::new(row.get_i64("tenant_id")?),
        author_id: UserId::new(row.get_i64("author_id")?),
        title: row.get_str("title")?.to_string(),
        body: row.get_str("body")?.to_string(),
        published: row.get_bool("published")?,
        created_at: row.get_timestamp("created_at")?,
    })
}

fn comment_from_row(row: &Row) -> QuillResult<Comment> {
    Ok(Comment {
        comment_id: CommentId::new(row.get_i64("comment_id")?),
        tenant_id: TenantId::new(row.get_i64("tenant_id")?),
        post_id: PostId::new(row.get_i64("post_id")?),
        author_id: UserId::new(row.get_i64("author_id")?),
        body: row.get_str("body")?.to_string(),
        created_at: row.get_timestamp("created_at")?,
    })
}

// ============================================================================
// QUERIES
// ============================================================================

/// Next free id in `table`: one past the largest `column` value.
async fn next_id<M>(conn: &mut PooledConnection<M>, table: &str, column: &str) -> QuillResult<i64>
where
    M: Manager,
    M::Type: Connection,
{
    let sql = format!("SELECT {column} FROM {table} ORDER BY {column} DESC LIMIT $1");
    let last = conn.query(&sql, &[SqlValue::Int(1)]).await?.single();
    match last {
        Some(row) => Ok(row.get_i64(column)? + 1),
        None => Ok(1),
    }
}

async fn find_post<M>(
    conn: &mut PooledConnection<M>,
    tenant_id: TenantId,
    post_id: PostId,
) -> QuillResult<Option<Post>>
where
    M: Manager,
    M::Type: Connection,
{
    let rows = conn
        .query(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE tenant_id = $1 AND post_id = $2"),
            &[tenant_id.as_i64().into(), post_id.as_i64().into()],
        )
        .await?;
    rows.single().as_ref().map(post_from_row).transpose()
}

async fn find_user<M>(conn: &mut PooledConnection<M>, user_id: UserId) -> QuillResult<Option<User>>
where
    M: Manager,
    M::Type: Connection,
{
    let rows = conn
        .query(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1"),
            &[user_id.as_i64().into()],
        )
        .await?;
    rows.single().as_ref().map(user_from_row).transpose()
}

/// Whether a reader with `flags` may see `post`.
fn visible(post: &Post, flags: RenderFlags) -> bool {
    post.published || flags.contains(RenderFlags::INCLUDE_DRAFTS)
}

fn require_text(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::invalid_input(format!("{} must not be empty", field)));
    }
    Ok(())
}

// ============================================================================
// LOADERS
// ============================================================================

/// Everything a loader needs, moved onto the loader task.
struct LoadCtx<M: Manager> {
    pools: Arc<ShardedPools<M>>,
    buffers: Arc<BufferPool>,
    tenant: Tenant,
    flags: RenderFlags,
}

async fn load_post_list<M>((ctx, page, page_size): (LoadCtx<M>, u32, u32)) -> QuillResult<Option<CacheEntry>>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    let offset = i64::from(page - 1) * i64::from(page_size);
    let tenant_id = ctx.tenant.tenant_id.as_i64();

    let mut conn = ctx.pools.acquire_for(&ctx.tenant).await?;
    let rows = if ctx.flags.contains(RenderFlags::INCLUDE_DRAFTS) {
        conn.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE tenant_id = $1 \
                 ORDER BY post_id DESC LIMIT $2 OFFSET $3"
            ),
            &[tenant_id.into(), page_size.into(), offset.into()],
        )
        .await?
    } else {
        conn.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE tenant_id = $1 AND published = $2 \
                 ORDER BY post_id DESC LIMIT $3 OFFSET $4"
            ),
            &[tenant_id.into(), true.into(), page_size.into(), offset.into()],
        )
        .await?
    };
    conn.release();

    let posts = rows.map(|row| post_from_row(&row)).collect::<QuillResult<Vec<_>>>()?;
    debug!(tenant = %ctx.tenant.slug, page, posts = posts.len(), "rendering post list");

    let mut buf = ctx.buffers.acquire();
    render::render_post_list(&mut buf, &ctx.tenant, page, &posts, ctx.flags)?;
    Ok(Some(render::finish(buf, ctx.flags)))
}

async fn load_post<M>((ctx, post_id): (LoadCtx<M>, PostId)) -> QuillResult<Option<CacheEntry>>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    let mut conn = ctx.pools.acquire_for(&ctx.tenant).await?;
    let post = find_post(&mut conn, ctx.tenant.tenant_id, post_id).await?;
    conn.release();

    let Some(post) = post.filter(|p| visible(p, ctx.flags)) else {
        return Ok(None);
    };
    let mut buf = ctx.buffers.acquire();
    render::render_post(&mut buf, &post, ctx.flags)?;
    Ok(Some(render::finish(buf, ctx.flags)))
}

async fn load_comments<M>((ctx, post_id): (LoadCtx<M>, PostId)) -> QuillResult<Option<CacheEntry>>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    // Post and comments share the tenant's shard: one connection serves both.
    let mut conn = ctx.pools.acquire_for(&ctx.tenant).await?;
    let post = find_post(&mut conn, ctx.tenant.tenant_id, post_id).await?;
    if !post.is_some_and(|p| visible(&p, ctx.flags)) {
        return Ok(None);
    }
    let rows = conn
        .query(
            &format!(
                "SELECT {COMMENT_COLUMNS} FROM comments WHERE tenant_id = $1 AND post_id = $2 \
                 ORDER BY comment_id ASC"
            ),
            &[ctx.tenant.tenant_id.as_i64().into(), post_id.as_i64().into()],
        )
        .await?;
    conn.release();

    let comments = rows.map(|row| comment_from_row(&row)).collect::<QuillResult<Vec<_>>>()?;
    let mut buf = ctx.buffers.acquire();
    render::render_comments(&mut buf, post_id, &comments, ctx.flags)?;
    Ok(Some(render::finish(buf, ctx.flags)))
}

async fn load_tenant_profile<M>(ctx: LoadCtx<M>) -> QuillResult<Option<CacheEntry>>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    let mut conn = ctx.pools.acquire_for(&ctx.tenant).await?;
    let published = conn
        .query(
            "SELECT post_id FROM posts WHERE tenant_id = $1 AND published = $2",
            &[ctx.tenant.tenant_id.as_i64().into(), true.into()],
        )
        .await?
        .remaining();
    conn.release();

    let mut buf = ctx.buffers.acquire();
    render::render_tenant(&mut buf, &ctx.tenant, published, ctx.flags)?;
    Ok(Some(render::finish(buf, ctx.flags)))
}

// ============================================================================
// HANDLERS
// ============================================================================

impl<M> AppState<M>
where
    M: Manager + 'static,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    fn load_ctx(&self, tenant: &Tenant, flags: RenderFlags) -> LoadCtx<M> {
        LoadCtx {
            pools: Arc::clone(&self.pools),
            buffers: Arc::clone(&self.buffers),
            tenant: tenant.clone(),
            flags,
        }
    }

    /// Look up a tenant by slug in the accounts database.
    pub async fn resolve_tenant(&self, slug: &str) -> ApiResult<Tenant> {
        let mut conn = self.pools.acquire(PoolTarget::Accounts).await?;
        let rows = conn
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE slug = $1"),
                &[slug.into()],
            )
            .await?;
        conn.release();

        let row = rows.single().ok_or_else(|| ApiError::tenant_not_found(slug))?;
        let tenant = tenant_from_row(&row)?;
        if !self.pools.router().contains(tenant.shard_id) {
            return Err(ApiError::from(quill_core::QuillError::from(StorageError::UnknownShard {
                shard: tenant.shard_id,
                shard_count: self.pools.shard_count(),
            })));
        }
        Ok(tenant)
    }

    /// Create a tenant and place it on a shard. The shard never changes.
    pub async fn create_tenant(&self, slug: &str) -> ApiResult<Tenant> {
        require_text("slug", slug)?;
        let mut conn = self.pools.acquire(PoolTarget::Accounts).await?;
        let existing = conn
            .query("SELECT tenant_id FROM tenants WHERE slug = $1", &[slug.into()])
            .await?;
        if existing.remaining() > 0 {
            return Err(ApiError::already_exists(format!("Tenant '{}' already exists", slug)));
        }

        let tenant_id = TenantId::new(next_id(&mut conn, "tenants", "tenant_id").await?);
        let tenant = Tenant {
            tenant_id,
            slug: slug.to_string(),
            shard_id: self.pools.router().assign(tenant_id),
            created_at: Utc::now(),
        };
        conn.execute(
            &format!("INSERT INTO tenants ({TENANT_COLUMNS}) VALUES ($1, $2, $3, $4)"),
            &[
                tenant_id.as_i64().into(),
                slug.into(),
                SqlValue::Int(tenant.shard_id.as_u16().into()),
                tenant.created_at.into(),
            ],
        )
        .await?;
        info!(tenant = %tenant.tenant_id, slug, shard = %tenant.shard_id, "Tenant created");
        Ok(tenant)
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> ApiResult<User> {
        require_text("username", username)?;
        let mut conn = self.pools.acquire(PoolTarget::Accounts).await?;
        let existing = conn
            .query("SELECT user_id FROM users WHERE username = $1", &[username.into()])
            .await?;
        if existing.remaining() > 0 {
            return Err(ApiError::already_exists(format!("User '{}' already exists", username)));
        }

        let user = User {
            user_id: UserId::new(next_id(&mut conn, "users", "user_id").await?),
            username: username.to_string(),
            display_name: display_name.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            &format!("INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4)"),
            &[
                user.user_id.as_i64().into(),
                username.into(),
                display_name.into(),
                user.created_at.into(),
            ],
        )
        .await?;
        info!(user = %user.user_id, username, "User created");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: UserId) -> ApiResult<User> {
        let mut conn = self.pools.acquire(PoolTarget::Accounts).await?;
        let user = find_user(&mut conn, user_id).await?;
        user.ok_or_else(|| ApiError::user_not_found(user_id))
    }

    /// One page of the tenant's posts, newest first. Pages start at 1.
    pub async fn list_posts(&self, tenant: &Tenant, page: u32, flags: RenderFlags) -> ApiResult<CacheHandle> {
        if page == 0 {
            return Err(ApiError::invalid_input("page must be at least 1"));
        }
        let key = CacheKey::post_list(tenant.tenant_id, page, flags);
        let arg = (self.load_ctx(tenant, flags), page, self.config.page_size);
        let handle = self
            .cache
            .fetch(key, load_post_list::<M>, arg, self.cache.default_options())
            .await?;
        handle.ok_or_else(|| ApiError::tenant_not_found(&tenant.slug))
    }

    pub async fn get_post(&self, tenant: &Tenant, post_id: PostId, flags: RenderFlags) -> ApiResult<CacheHandle> {
        let key = CacheKey::new(ResponseKind::Post, tenant.tenant_id, post_id.as_i64(), flags);
        let arg = (self.load_ctx(tenant, flags), post_id);
        let handle = self
            .cache
            .fetch(key, load_post::<M>, arg, self.cache.default_options())
            .await?;
        handle.ok_or_else(|| ApiError::post_not_found(post_id))
    }

    /// Comments of a visible post, oldest first.
    pub async fn list_comments(
        &self,
        tenant: &Tenant,
        post_id: PostId,
        flags: RenderFlags,
    ) -> ApiResult<CacheHandle> {
        let key = CacheKey::new(ResponseKind::CommentList, tenant.tenant_id, post_id.as_i64(), flags);
        let arg = (self.load_ctx(tenant, flags), post_id);
        let handle = self
            .cache
            .fetch(key, load_comments::<M>, arg, self.cache.default_options())
            .await?;
        handle.ok_or_else(|| ApiError::post_not_found(post_id))
    }

    pub async fn tenant_profile(&self, tenant: &Tenant, flags: RenderFlags) -> ApiResult<CacheHandle> {
        let key = CacheKey::new(ResponseKind::TenantProfile, tenant.tenant_id, 0, flags);
        let handle = self
            .cache
            .fetch(
                key,
                load_tenant_profile::<M>,
                self.load_ctx(tenant, flags),
                self.cache.default_options(),
            )
            .await?;
        handle.ok_or_else(|| ApiError::tenant_not_found(&tenant.slug))
    }

    /// Publish (or draft) a post, then drop the tenant's cached responses.
    pub async fn create_post(
        &self,
        tenant: &Tenant,
        author_id: UserId,
        title: &str,
        body: &str,
        published: bool,
    ) -> ApiResult<Post> {
        require_text("title", title)?;
        self.get_user(author_id).await?;

        let mut conn = self.pools.acquire_for(tenant).await?;
        let post = Post {
            post_id: PostId::new(next_id(&mut conn, "posts", "post_id").await?),
            tenant_id: tenant.tenant_id,
            author_id,
            title: title.to_string(),
            body: body.to_string(),
            published,
            created_at: Utc::now(),
        };
        conn.execute(
            &format!("INSERT INTO posts ({POST_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"),
            &[
                post.post_id.as_i64().into(),
                post.tenant_id.as_i64().into(),
                author_id.as_i64().into(),
                title.into(),
                body.into(),
                published.into(),
                post.created_at.into(),
            ],
        )
        .await?;
        conn.release();

        let dropped = self.cache.invalidate_tenant(tenant.tenant_id)?;
        info!(tenant = %tenant.slug, post = %post.post_id, dropped, "Post created");
        Ok(post)
    }

    /// Comment on a visible post, then drop the tenant's cached responses.
    pub async fn create_comment(
        &self,
        tenant: &Tenant,
        post_id: PostId,
        author_id: UserId,
        body: &str,
    ) -> ApiResult<Comment> {
        require_text("body", body)?;
        self.get_user(author_id).await?;

        let mut conn = self.pools.acquire_for(tenant).await?;
        let post = find_post(&mut conn, tenant.tenant_id, post_id).await?;
        if !post.is_some_and(|p| p.published) {
            return Err(ApiError::from(quill_core::QuillError::from(StorageError::NotFound {
                entity: EntityKind::Post,
                id: post_id.as_i64(),
            })));
        }

        let comment = Comment {
            comment_id: CommentId::new(next_id(&mut conn, "comments", "comment_id").await?),
            tenant_id: tenant.tenant_id,
            post_id,
            author_id,
            body: body.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            &format!("INSERT INTO comments ({COMMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"),
            &[
                comment.comment_id.as_i64().into(),
                tenant.tenant_id.as_i64().into(),
                post_id.as_i64().into(),
                author_id.as_i64().into(),
                body.into(),
                comment.created_at.into(),
            ],
        )
        .await?;
        conn.release();

        let dropped = self.cache.invalidate_tenant(tenant.tenant_id)?;
        debug!(tenant = %tenant.slug, post = %post_id, comment = %comment.comment_id, dropped, "Comment created");
        Ok(comment)
    }
}
