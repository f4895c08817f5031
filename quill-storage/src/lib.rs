//! Quill Storage - Response Cache, Connection Pools and Buffers
//!
//! The shared-resource layer every request handler goes through:
//!
//! - [`cache`]: single-flight, size-bounded, TTL-expiring cache of rendered
//!   responses, keyed by tenant-scoped binary keys.
//! - [`pool`]: one connection pool per shard plus an accounts pool, with
//!   PostgreSQL and in-memory backends.
//! - [`buffer`]: reusable scratch buffers for rendering response bodies.

pub mod buffer;
pub mod cache;
pub mod pool;

pub use buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, PooledBuffer};
pub use cache::{
    CacheConfig, CacheEntry, CacheHandle, CacheKey, CacheStats, FetchOptions, ResponseCache,
    ResponseKind,
};
pub use pool::{
    Connection, ConnectionPool, DbConfig, MemoryManager, MemoryShardedPools, MemoryStore,
    PgShardedPools, PoolConfig, PoolStatus, PoolTarget, PooledConnection, Row, RowCursor,
    ShardConfig, ShardedPools, SqlValue,
};
