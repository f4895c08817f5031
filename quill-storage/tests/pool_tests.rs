//! Sharded pool behavior over the in-memory backend.

use quill_storage::{PoolTarget, SqlValue};
use quill_test_utils::assertions::assert_pool_exhausted;
use quill_test_utils::fixtures::{memory_pools, tenant};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_exhausted_shard_does_not_block_others() {
    let pools = memory_pools(2);
    let busy = tenant(&pools, 2, "busy");
    let idle = tenant(&pools, 3, "idle");

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pools.acquire_for(&busy).await.unwrap());
    }
    let err = pools.acquire_for(&busy).await.unwrap_err();
    assert_pool_exhausted(&err);

    // The other shard and the accounts pool are unaffected.
    assert!(pools.acquire_for(&idle).await.is_ok());
    assert!(pools.acquire(PoolTarget::Accounts).await.is_ok());
    drop(held);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_gets_released_connection() {
    let pools = memory_pools(1);
    let t = tenant(&pools, 1, "solo");

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pools.acquire_for(&t).await.unwrap());
    }

    let waiter = {
        let pools = pools.clone();
        let t = t.clone();
        tokio::spawn(async move { pools.acquire_for(&t).await.map(drop) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    held.pop();

    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_parent_and_child_rows_share_one_connection() {
    let pools = memory_pools(3);
    let t = tenant(&pools, 7, "blog");

    let mut conn = pools.acquire_for(&t).await.unwrap();
    conn.execute(
        "INSERT INTO posts (post_id, tenant_id, title) VALUES ($1, $2, $3)",
        &[SqlValue::Int(1), SqlValue::Int(7), "First".into()],
    )
    .await
    .unwrap();
    conn.execute(
        "INSERT INTO comments (comment_id, tenant_id, post_id, body) VALUES ($1, $2, $3, $4)",
        &[SqlValue::Int(10), SqlValue::Int(7), SqlValue::Int(1), "Nice".into()],
    )
    .await
    .unwrap();

    let post = conn
        .query("SELECT post_id FROM posts WHERE tenant_id = $1", &[SqlValue::Int(7)])
        .await
        .unwrap()
        .single()
        .unwrap();
    let post_id = post.get_i64("post_id").unwrap();
    let comments = conn
        .query(
            "SELECT body FROM comments WHERE tenant_id = $1 AND post_id = $2",
            &[SqlValue::Int(7), SqlValue::Int(post_id)],
        )
        .await
        .unwrap();
    assert_eq!(comments.remaining(), 1);
    conn.release();

    for shard in 0..3u16 {
        let target = PoolTarget::Shard(quill_test_utils::ShardId::new(shard));
        let store = pools.pool(target).unwrap().manager().store().clone();
        let expected = if target == PoolTarget::Shard(t.shard_id) { 1 } else { 0 };
        assert_eq!(store.row_count("posts").await.unwrap(), expected, "{target}");
    }
}

#[tokio::test]
async fn test_restart_replaces_connections() {
    let pools = memory_pools(1);
    let t = tenant(&pools, 0, "zero");
    let store = pools.pool(PoolTarget::Shard(t.shard_id)).unwrap().manager().store().clone();

    let first = pools.acquire_for(&t).await.unwrap();
    first.release();
    assert_eq!(store.connections_opened(), 1);

    store.restart();

    // The idle connection fails the recycle check and is replaced.
    let mut conn = pools.acquire_for(&t).await.unwrap();
    assert!(conn.query("SELECT * FROM posts", &[]).await.is_ok());
    assert_eq!(store.connections_opened(), 2);
}
