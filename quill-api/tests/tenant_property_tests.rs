//! Property-Based Tests for Tenant Placement
//!
//! **Property 1: A tenant keeps the shard it was assigned**
//!
//! For any shard count and any set of tenant slugs, each created tenant is
//! placed on `router().assign(tenant_id)`, resolving its slug later returns
//! that same shard, and posts written for it land on that shard only.

use std::collections::BTreeSet;

use proptest::prelude::*;
use quill_api::{MemoryAppState, ServiceConfig};
use quill_core::{EntityIdType, RenderFlags, ShardId};
use quill_storage::{PoolConfig, PoolTarget, ShardConfig};
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn state(shards: usize) -> MemoryAppState {
    let defaults = ShardConfig::default();
    let config = ServiceConfig::default().with_shards(ShardConfig {
        shards: vec![defaults.accounts.clone(); shards],
        pool: PoolConfig::new().with_max_size(2),
        ..defaults
    });
    MemoryAppState::memory(config).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_tenant_shard_is_stable(
        shards in 1usize..5,
        slugs in prop::collection::btree_set("[a-z]{3,10}", 1..8),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let state = state(shards);
            let author = state.create_user("author", "Author").await.unwrap();

            let mut per_shard = vec![0usize; shards];
            let mut ids = BTreeSet::new();
            for slug in &slugs {
                let created = state.create_tenant(slug).await.unwrap();
                ids.insert(created.tenant_id.as_i64());
                let assigned = state.pools.router().assign(created.tenant_id);
                prop_assert_eq!(created.shard_id, assigned);

                let resolved = state.resolve_tenant(slug).await.unwrap();
                prop_assert_eq!(resolved.tenant_id, created.tenant_id);
                prop_assert_eq!(resolved.shard_id, assigned);

                state
                    .create_post(&resolved, author.user_id, "title", "body", true)
                    .await
                    .unwrap();
                per_shard[assigned.index()] += 1;

                let handle = state
                    .list_posts(&resolved, 1, RenderFlags::empty())
                    .await
                    .unwrap();
                let json: serde_json::Value = serde_json::from_slice(handle.body()).unwrap();
                prop_assert_eq!(json["posts"].as_array().map(Vec::len), Some(1));
            }

            for (shard, expected) in per_shard.iter().enumerate() {
                let store = state
                    .pools
                    .pool(PoolTarget::Shard(ShardId::new(shard as u16)))
                    .unwrap()
                    .manager()
                    .store()
                    .clone();
                prop_assert_eq!(store.row_count("posts").await.unwrap(), *expected);
            }
            prop_assert_eq!(ids.len(), slugs.len());
            Ok(())
        })?;
    }
}
