//! Shared application state for request handlers.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use deadpool::managed::Manager;
use quill_core::{HealthCheck, HealthStatus, QuillResult};
use quill_storage::{
    BufferPool, BufferPoolStats, CacheStats, Connection, MemoryManager, ResponseCache, ShardedPools,
};
use serde::Serialize;
use tracing::info;

use crate::config::ServiceConfig;

/// State shared by every handler. Cloning is cheap.
pub struct AppState<M: Manager> {
    /// Shard pools plus the accounts pool.
    pub pools: Arc<ShardedPools<M>>,
    /// Rendered-response cache.
    pub cache: ResponseCache,
    /// Scratch buffers for rendering.
    pub buffers: Arc<BufferPool>,
    pub config: Arc<ServiceConfig>,
    pub start_time: Instant,
}

/// State backed by PostgreSQL shards.
pub type PgAppState = AppState<deadpool_postgres::Manager>;

/// State backed by in-memory stores.
pub type MemoryAppState = AppState<MemoryManager>;

impl<M: Manager> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            pools: Arc::clone(&self.pools),
            cache: self.cache.clone(),
            buffers: Arc::clone(&self.buffers),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
        }
    }
}

/// Health report covering pools, cache and buffers.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub pools: HealthCheck,
    pub cache: CacheStats,
    pub buffers: BufferPoolStats,
}

impl<M> AppState<M>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    /// Assemble state from already-built pools.
    pub fn from_parts(config: ServiceConfig, pools: ShardedPools<M>) -> QuillResult<Self> {
        config.validate()?;
        let cache = ResponseCache::new(config.cache.clone())?;
        let buffers = BufferPool::new(config.buffers.clone())?;
        info!(
            shards = pools.shard_count(),
            cache_capacity = config.cache.capacity_bytes,
            page_size = config.page_size,
            "Service state ready"
        );
        Ok(Self {
            pools: Arc::new(pools),
            cache,
            buffers,
            config: Arc::new(config),
            start_time: Instant::now(),
        })
    }

    pub fn health(&self) -> QuillResult<ServiceHealth> {
        let pools = self.pools.health();
        Ok(ServiceHealth {
            status: HealthStatus::Healthy.worst(pools.status),
            uptime_secs: self.start_time.elapsed().as_secs(),
            pools,
            cache: self.cache.stats()?,
            buffers: self.buffers.stats(),
        })
    }

    /// Close every pool. Borrowed connections finish their work first.
    pub fn shutdown(&self) {
        info!("Closing connection pools");
        self.pools.close();
    }
}

impl PgAppState {
    /// Connect to the configured PostgreSQL shards. Connections open lazily.
    pub fn postgres(config: ServiceConfig) -> QuillResult<Self> {
        config.validate()?;
        let pools = ShardedPools::postgres(&config.shards)?;
        Self::from_parts(config, pools)
    }
}

impl MemoryAppState {
    /// In-memory shards, one per configured shard database.
    pub fn memory(config: ServiceConfig) -> QuillResult<Self> {
        config.validate()?;
        let pools = ShardedPools::memory(config.shards.shard_count(), &config.shards.pool)?;
        Self::from_parts(config, pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_storage::{PoolTarget, ShardConfig};

    #[tokio::test]
    async fn test_memory_state_is_healthy() {
        let state = MemoryAppState::memory(ServiceConfig::default()).unwrap();
        let health = state.health().unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.cache.entry_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_makes_state_unhealthy() {
        let state = MemoryAppState::memory(ServiceConfig::default()).unwrap();
        let clone = state.clone();
        state.shutdown();
        assert_eq!(clone.health().unwrap().status, HealthStatus::Unhealthy);
        assert!(clone.pools.acquire(PoolTarget::Accounts).await.is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ServiceConfig::default().with_shards(ShardConfig {
            shards: Vec::new(),
            ..ShardConfig::default()
        });
        assert!(MemoryAppState::memory(config).is_err());
    }
}
