//! Sharded connection pools.
//!
//! Each backing-store shard has its own [`ConnectionPool`]; account data
//! lives in a separate accounts pool. [`ShardedPools`] routes a tenant to
//! the pool of the shard recorded in its [`Tenant`](quill_core::Tenant)
//! record.
//!
//! Hold a [`PooledConnection`] only as long as the queries need it. Release
//! it before rendering or copying output, so other requests are not kept
//! waiting on work that doesn't touch the database.

pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod memory;
pub mod postgres;
pub mod shard;

pub use config::{DbConfig, PoolConfig, ShardConfig};
pub use connection::{Connection, Row, RowCursor, SqlValue};
pub use connection_pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use memory::{MemoryConnection, MemoryManager, MemoryStore};
pub use shard::{PoolTarget, ShardedPools};

/// Pools backed by PostgreSQL.
pub type PgShardedPools = ShardedPools<deadpool_postgres::Manager>;

/// Pools backed by in-memory stores.
pub type MemoryShardedPools = ShardedPools<MemoryManager>;
