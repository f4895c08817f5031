//! Quill Test Utilities
//!
//! Shared test infrastructure for the Quill workspace:
//! - Proptest generators for keys, flags and entries
//! - Fixtures for in-memory pools, caches and buffers
//! - Loaders with observable call counts
//! - Assertions on cache and pool state

pub use quill_core::{
    ContentType, EntityIdType, PostId, QuillError, QuillResult, RenderFlags, ShardId,
    StorageError, Tenant, TenantId, Timestamp, UserId,
};
pub use quill_storage::{
    BufferPool, CacheEntry, CacheKey, CacheStats, MemoryShardedPools, ResponseCache,
    ResponseKind,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Quill types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        any::<i64>().prop_map(TenantId::new)
    }

    pub fn arb_response_kind() -> impl Strategy<Value = ResponseKind> {
        prop_oneof![
            Just(ResponseKind::PostList),
            Just(ResponseKind::Post),
            Just(ResponseKind::CommentList),
            Just(ResponseKind::TenantProfile),
        ]
    }

    pub fn arb_render_flags() -> impl Strategy<Value = RenderFlags> {
        any::<u8>().prop_map(RenderFlags::from_bits_truncate)
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_response_kind(), arb_tenant_id(), any::<i64>(), arb_render_flags())
            .prop_map(|(kind, tenant, subject, flags)| CacheKey::new(kind, tenant, subject, flags))
    }

    pub fn arb_content_type() -> impl Strategy<Value = ContentType> {
        prop_oneof![
            Just(ContentType::Json),
            Just(ContentType::Xml),
            Just(ContentType::Html),
            Just(ContentType::PlainText),
        ]
    }

    /// Entries of up to `max_len` body bytes.
    pub fn arb_cache_entry(max_len: usize) -> impl Strategy<Value = CacheEntry> {
        (
            prop_oneof![Just(200u16), Just(201u16), Just(404u16)],
            arb_content_type(),
            proptest::collection::vec(any::<u8>(), 0..=max_len),
        )
            .prop_map(|(status, content_type, body)| CacheEntry::new(status, content_type, body))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made instances for tests.

    use super::*;
    use chrono::Utc;
    use quill_storage::{BufferPoolConfig, CacheConfig, PoolConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Pool settings that fail fast instead of waiting seconds.
    pub fn test_pool_config() -> PoolConfig {
        PoolConfig::new()
            .with_max_size(4)
            .with_wait_timeout(Duration::from_millis(200))
    }

    /// In-memory pools with `shard_count` shards.
    pub fn memory_pools(shard_count: usize) -> MemoryShardedPools {
        match MemoryShardedPools::memory(shard_count, &test_pool_config()) {
            Ok(pools) => pools,
            Err(err) => panic!("failed to build memory pools: {err}"),
        }
    }

    /// A cache holding at most `capacity_bytes`, with a 1s loader timeout.
    pub fn test_cache(capacity_bytes: usize) -> ResponseCache {
        let config = CacheConfig::new()
            .with_capacity(capacity_bytes)
            .with_load_timeout(Duration::from_secs(1));
        match ResponseCache::new(config) {
            Ok(cache) => cache,
            Err(err) => panic!("failed to build cache: {err}"),
        }
    }

    pub fn test_buffers() -> Arc<BufferPool> {
        match BufferPool::new(BufferPoolConfig::default().with_initial_capacity(256)) {
            Ok(pool) => pool,
            Err(err) => panic!("failed to build buffer pool: {err}"),
        }
    }

    /// A tenant placed by the pools' router.
    pub fn tenant(pools: &MemoryShardedPools, id: i64, slug: &str) -> Tenant {
        let tenant_id = TenantId::new(id);
        Tenant {
            tenant_id,
            slug: slug.to_string(),
            shard_id: pools.router().assign(tenant_id),
            created_at: Utc::now(),
        }
    }

    /// A `200 OK` plain-text entry.
    pub fn text_entry(text: &str) -> CacheEntry {
        CacheEntry::ok(ContentType::PlainText, text.as_bytes().to_vec())
    }

    /// Counts loader invocations across clones.
    #[derive(Debug, Clone, Default)]
    pub struct CallCounter(Arc<AtomicUsize>);

    impl CallCounter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        pub fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Loader returning `text` after `delay`, counting its calls.
    pub async fn delayed_text(
        (counter, text, delay): (CallCounter, &'static str, Duration),
    ) -> QuillResult<Option<CacheEntry>> {
        counter.hit();
        tokio::time::sleep(delay).await;
        Ok(Some(text_entry(text)))
    }

    /// Loader reporting "not found", counting its calls.
    pub async fn not_found(counter: CallCounter) -> QuillResult<Option<CacheEntry>> {
        counter.hit();
        Ok(None)
    }

    /// Loader failing with a query error, counting its calls.
    pub async fn failing(counter: CallCounter) -> QuillResult<Option<CacheEntry>> {
        counter.hit();
        Err(StorageError::QueryFailed {
            reason: "simulated failure".to_string(),
        }
        .into())
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on shared-resource state.

    use super::*;

    /// Assert the cache's memory accounting matches `entries` and `bytes`.
    pub fn assert_cache_usage(stats: &CacheStats, entries: u64, bytes: u64) {
        assert_eq!(stats.entry_count, entries, "entry count: {stats:?}");
        assert_eq!(stats.memory_bytes, bytes, "memory bytes: {stats:?}");
    }

    /// Assert no evicted entry is still waiting for its readers.
    pub fn assert_nothing_pending_disposal(stats: &CacheStats) {
        assert_eq!(stats.pending_disposal, 0, "entries pending disposal: {stats:?}");
    }

    /// Assert `err` is the retryable pool exhaustion error.
    pub fn assert_pool_exhausted(err: &QuillError) {
        assert!(
            matches!(err, QuillError::Storage(StorageError::PoolExhausted { .. })),
            "expected PoolExhausted, got {err:?}"
        );
        assert!(err.is_retryable());
    }
}
