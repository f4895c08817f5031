//! Per-shard pools plus the accounts pool.
//!
//! Tenant data is reached only through the pool of the tenant's shard, so a
//! query can never run against the wrong shard. Parent and child records of
//! one tenant share a shard and can be read over a single connection.

use std::fmt;

use deadpool::managed::Manager;
use quill_core::{HealthCheck, HealthStatus, QuillResult, ShardId, ShardRouter, StorageError, Tenant};
use serde::Serialize;

use super::connection::Connection;
use super::connection_pool::{ConnectionPool, PoolStatus, PooledConnection};

/// Which pool a connection is borrowed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolTarget {
    /// Tenant data on one shard.
    Shard(ShardId),
    /// Users and tenants.
    Accounts,
}

impl fmt::Display for PoolTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolTarget::Shard(shard) => write!(f, "{}", shard),
            PoolTarget::Accounts => f.write_str("accounts"),
        }
    }
}

/// One pool per shard, indexed by [`ShardId::index`], and one accounts pool.
pub struct ShardedPools<M: Manager> {
    shards: Vec<ConnectionPool<M>>,
    accounts: ConnectionPool<M>,
    router: ShardRouter,
}

impl<M: Manager> Clone for ShardedPools<M> {
    fn clone(&self) -> Self {
        Self {
            shards: self.shards.clone(),
            accounts: self.accounts.clone(),
            router: self.router,
        }
    }
}

impl<M> ShardedPools<M>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    /// Combine shard pools (shard `n` at position `n`) with an accounts pool.
    pub fn new(shards: Vec<ConnectionPool<M>>, accounts: ConnectionPool<M>) -> QuillResult<Self> {
        let router = ShardRouter::new(shards.len())?;
        Ok(Self {
            shards,
            accounts,
            router,
        })
    }

    /// Router over this set of shards, for assigning new tenants.
    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The pool serving `target`.
    pub fn pool(&self, target: PoolTarget) -> QuillResult<&ConnectionPool<M>> {
        match target {
            PoolTarget::Accounts => Ok(&self.accounts),
            PoolTarget::Shard(shard) => self.shards.get(shard.index()).ok_or_else(|| {
                StorageError::UnknownShard {
                    shard,
                    shard_count: self.shards.len(),
                }
                .into()
            }),
        }
    }

    pub async fn acquire(&self, target: PoolTarget) -> QuillResult<PooledConnection<M>> {
        self.pool(target)?.acquire().await
    }

    /// Borrow a connection to the shard holding `tenant`'s data.
    pub async fn acquire_for(&self, tenant: &Tenant) -> QuillResult<PooledConnection<M>> {
        self.acquire(PoolTarget::Shard(tenant.shard_id())).await
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.shards
            .iter()
            .chain(std::iter::once(&self.accounts))
            .map(ConnectionPool::status)
            .collect()
    }

    /// Aggregate health of every pool. The worst pool decides the status.
    pub fn health(&self) -> HealthCheck {
        let checks: Vec<HealthCheck> = self
            .shards
            .iter()
            .chain(std::iter::once(&self.accounts))
            .map(ConnectionPool::health)
            .collect();
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
        let failing: Vec<&str> = checks
            .iter()
            .filter(|check| check.status != HealthStatus::Healthy)
            .map(|check| check.component.as_str())
            .collect();
        let pools = serde_json::to_value(&checks).unwrap_or_default();

        let check = match status {
            HealthStatus::Healthy => HealthCheck::healthy("connection_pools"),
            HealthStatus::Degraded => {
                HealthCheck::degraded("connection_pools", format!("pools under pressure: {}", failing.join(", ")))
            }
            HealthStatus::Unhealthy => {
                HealthCheck::unhealthy("connection_pools", format!("pools unavailable: {}", failing.join(", ")))
            }
        };
        check.with_metadata("pools", pools)
    }

    pub fn close(&self) {
        for pool in self.shards.iter().chain(std::iter::once(&self.accounts)) {
            pool.close();
        }
    }
}
