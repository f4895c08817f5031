//! End-to-end handler flows over in-memory shards.

use std::time::Duration;

use quill_api::{ErrorCode, MemoryAppState, ServiceConfig};
use quill_core::{EntityIdType, RenderFlags, ShardId, TenantId};
use quill_storage::{PoolConfig, PoolTarget, ShardConfig};
use quill_test_utils::assertions::assert_nothing_pending_disposal;

fn config(shards: usize, pool: PoolConfig) -> ServiceConfig {
    let defaults = ShardConfig::default();
    ServiceConfig::default().with_shards(ShardConfig {
        shards: vec![defaults.accounts.clone(); shards],
        pool,
        ..defaults
    })
}

fn state(shards: usize) -> MemoryAppState {
    MemoryAppState::memory(config(shards, PoolConfig::new().with_max_size(4))).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_list_requests_share_one_load() {
    let state = state(2);
    let tenant = state.create_tenant("daily").await.unwrap();
    let user = state.create_user("ada", "Ada").await.unwrap();
    state
        .create_post(&tenant, user.user_id, "Hello", "world", true)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let state = state.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                let handle = state.list_posts(&tenant, 1, RenderFlags::empty()).await?;
                Ok::<_, quill_api::ApiError>(handle.body().to_vec())
            })
        })
        .collect();

    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(task.await.unwrap().unwrap());
    }
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));

    let stats = state.cache.stats().unwrap();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.coalesced, 15);
}

#[tokio::test]
async fn test_exhausted_shard_pool_is_503_and_not_cached() {
    let pool = PoolConfig::new()
        .with_max_size(1)
        .with_wait_timeout(Duration::from_millis(50));
    let state = MemoryAppState::memory(config(1, pool)).unwrap();
    let tenant = state.create_tenant("busy").await.unwrap();

    let held = state.pools.acquire_for(&tenant).await.unwrap();
    let err = state
        .list_posts(&tenant, 1, RenderFlags::empty())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConnectionPoolExhausted);
    assert_eq!(err.status_code(), 503);
    assert!(err.code.is_retryable());

    // The accounts pool is separate and still serves requests.
    assert!(state.resolve_tenant("busy").await.is_ok());

    held.release();
    let handle = state.list_posts(&tenant, 1, RenderFlags::empty()).await.unwrap();
    assert_eq!(handle.status(), 200);
    assert_eq!(state.cache.stats().unwrap().loads, 1);
}

#[tokio::test]
async fn test_tenant_data_stays_on_its_shard() {
    let state = state(2);
    let first = state.create_tenant("first").await.unwrap();
    let second = state.create_tenant("second").await.unwrap();
    assert_eq!(first.tenant_id, TenantId::new(1));
    assert_eq!(first.shard_id, ShardId::new(1));
    assert_eq!(second.shard_id, ShardId::new(0));

    let user = state.create_user("ada", "Ada").await.unwrap();
    state
        .create_post(&first, user.user_id, "Only here", "x", true)
        .await
        .unwrap();

    for (shard, expected) in [(1, 1), (0, 0)] {
        let store = state
            .pools
            .pool(PoolTarget::Shard(ShardId::new(shard)))
            .unwrap()
            .manager()
            .store()
            .clone();
        assert_eq!(store.row_count("posts").await.unwrap(), expected, "shard {shard}");
    }

    let handle = state.list_posts(&second, 1, RenderFlags::empty()).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(handle.body()).unwrap();
    assert!(json["posts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_handle_outlives_invalidating_write() {
    let state = state(1);
    let tenant = state.create_tenant("daily").await.unwrap();
    let user = state.create_user("ada", "Ada").await.unwrap();
    let post = state
        .create_post(&tenant, user.user_id, "Hello", "world", true)
        .await
        .unwrap();

    let handle = state
        .get_post(&tenant, post.post_id, RenderFlags::XML)
        .await
        .unwrap();
    let before = handle.body().to_vec();

    state
        .create_comment(&tenant, post.post_id, user.user_id, "first!")
        .await
        .unwrap();
    assert!(!state.cache.contains(&quill_storage::CacheKey::new(
        quill_storage::ResponseKind::Post,
        tenant.tenant_id,
        post.post_id.as_i64(),
        RenderFlags::XML,
    ))
    .unwrap());

    // The evicted entry stays readable until its handle goes away.
    assert_eq!(handle.body(), &before[..]);
    assert_eq!(state.cache.stats().unwrap().pending_disposal, 1);
    handle.release();

    let stats = state.cache.stats().unwrap();
    assert_nothing_pending_disposal(&stats);
    assert_eq!(stats.disposed, 1);
}

#[tokio::test]
async fn test_restarted_shard_recovers() {
    let state = state(1);
    let tenant = state.create_tenant("daily").await.unwrap();

    let store = state
        .pools
        .pool(PoolTarget::Shard(tenant.shard_id))
        .unwrap()
        .manager()
        .store()
        .clone();
    store.set_unavailable(true);
    let err = state
        .tenant_profile(&tenant, RenderFlags::empty())
        .await
        .unwrap_err();
    assert!(matches!(err.code, ErrorCode::ServiceUnavailable | ErrorCode::DatabaseError));

    store.set_unavailable(false);
    store.restart();
    let handle = state.tenant_profile(&tenant, RenderFlags::empty()).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(handle.body()).unwrap();
    assert_eq!(json["slug"], "daily");
    assert_eq!(json["published_posts"], 0);
}
