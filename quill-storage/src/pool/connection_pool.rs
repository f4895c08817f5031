//! A named pool of connections to one backing store.
//!
//! Built on `deadpool::managed`: connections are opened lazily up to
//! `max_size`, checked by the manager's recycle step before reuse and
//! handed out behind a [`PooledConnection`] guard. `acquire` on a full pool
//! waits up to the configured `wait_timeout` and then fails with
//! [`StorageError::PoolExhausted`].

use std::fmt;
use std::sync::Arc;

use deadpool::managed::{Manager, Object, Pool, PoolError, TimeoutType};
use quill_core::{ConfigError, HealthCheck, QuillResult, StorageError};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::PoolConfig;
use super::connection::{Connection, RowCursor, SqlValue};

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub max_size: usize,
    /// Connections currently open.
    pub size: usize,
    /// Open connections not lent out.
    pub available: usize,
    /// Callers waiting in `acquire`.
    pub waiting: usize,
}

/// A pool of connections produced by manager `M`.
pub struct ConnectionPool<M: Manager> {
    name: Arc<str>,
    pool: Pool<M>,
}

impl<M: Manager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            pool: self.pool.clone(),
        }
    }
}

impl<M> ConnectionPool<M>
where
    M: Manager,
    M::Type: Connection,
    M::Error: fmt::Display,
{
    /// Build a pool around `manager`.
    pub fn new(name: impl Into<String>, manager: M, config: &PoolConfig) -> QuillResult<Self> {
        config.validate()?;
        let name: String = name.into();
        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .timeouts(config.timeouts())
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "pool".to_string(),
                value: name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_pool(name, pool))
    }

    /// Wrap an already built deadpool pool.
    pub fn from_pool(name: impl Into<String>, pool: Pool<M>) -> Self {
        Self {
            name: Arc::from(name.into()),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &M {
        self.pool.manager()
    }

    /// Borrow a connection, waiting up to the pool's wait timeout.
    pub async fn acquire(&self) -> QuillResult<PooledConnection<M>> {
        let started = Instant::now();
        match self.pool.get().await {
            Ok(object) => Ok(PooledConnection {
                pool: Arc::clone(&self.name),
                object: Some(object),
                broken: false,
            }),
            Err(err) => Err(self.map_pool_error(err, started).into()),
        }
    }

    fn map_pool_error(&self, err: PoolError<M::Error>, started: Instant) -> StorageError {
        let pool = self.name.to_string();
        match err {
            PoolError::Timeout(TimeoutType::Wait) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                let status = self.pool.status();
                warn!(
                    pool = %self.name,
                    waited_ms,
                    max_size = status.max_size,
                    waiting = status.waiting,
                    "Connection pool exhausted"
                );
                StorageError::PoolExhausted { pool, waited_ms }
            }
            PoolError::Timeout(TimeoutType::Create) => StorageError::ConnectFailed {
                pool,
                reason: "timed out opening connection".to_string(),
            },
            PoolError::Timeout(TimeoutType::Recycle) => StorageError::ConnectFailed {
                pool,
                reason: "timed out checking connection".to_string(),
            },
            PoolError::Backend(e) => StorageError::ConnectFailed {
                pool,
                reason: e.to_string(),
            },
            PoolError::PostCreateHook(e) => StorageError::ConnectFailed {
                pool,
                reason: e.to_string(),
            },
            PoolError::Closed => StorageError::PoolClosed { pool },
            other => StorageError::ConnectFailed {
                pool,
                reason: other.to_string(),
            },
        }
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            name: self.name.to_string(),
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Report the pool's health from its occupancy.
    ///
    /// A closed pool is unhealthy; a pool with callers queued for a
    /// connection is degraded.
    pub fn health(&self) -> HealthCheck {
        let status = self.status();
        let check = if self.pool.is_closed() {
            HealthCheck::unhealthy(self.name.to_string(), "pool is closed")
        } else if status.waiting > 0 {
            HealthCheck::degraded(
                self.name.to_string(),
                format!("{} callers waiting for a connection", status.waiting),
            )
        } else {
            HealthCheck::healthy(self.name.to_string())
        };
        check
            .with_metadata("max_size", status.max_size.into())
            .with_metadata("size", status.size.into())
            .with_metadata("available", status.available.into())
            .with_metadata("waiting", status.waiting.into())
    }

    /// Close the pool. Waiting and future `acquire` calls fail with
    /// [`StorageError::PoolClosed`].
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Exclusive use of one pooled connection.
///
/// The connection returns to its pool when the guard is dropped or
/// [`release`](PooledConnection::release)d. A guard that saw
/// [`StorageError::ConnectionBroken`] detaches its connection instead, and
/// the pool opens a replacement on demand.
pub struct PooledConnection<M: Manager> {
    pool: Arc<str>,
    object: Option<Object<M>>,
    broken: bool,
}

impl<M> PooledConnection<M>
where
    M: Manager,
    M::Type: Connection,
{
    fn connection(&self) -> QuillResult<&M::Type> {
        self.object.as_deref().ok_or_else(|| {
            StorageError::ConnectionBroken {
                reason: "connection already detached".to_string(),
            }
            .into()
        })
    }

    fn observe<T>(&mut self, result: QuillResult<T>) -> QuillResult<T> {
        if let Err(err) = &result {
            if err.is_connection_broken() {
                self.broken = true;
            } else {
                debug!(pool = %self.pool, error = %err, "statement failed, connection kept");
            }
        }
        result
    }

    pub async fn execute(&mut self, sql: &str, args: &[SqlValue]) -> QuillResult<u64> {
        let result = self.connection()?.execute(sql, args).await;
        self.observe(result)
    }

    pub async fn query(&mut self, sql: &str, args: &[SqlValue]) -> QuillResult<RowCursor> {
        let result = self.connection()?.query(sql, args).await;
        self.observe(result)
    }

    /// Name of the pool this connection came from.
    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    /// Whether this connection will be discarded instead of reused.
    pub fn is_broken(&self) -> bool {
        self.broken
            || self
                .object
                .as_deref()
                .is_some_and(Connection::is_broken)
    }

    /// Return the connection to its pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if !self.broken {
            return;
        }
        if let Some(object) = self.object.take() {
            warn!(pool = %self.pool, "discarding broken connection");
            drop(Object::take(object));
        }
    }
}

impl<M: Manager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::{MemoryManager, MemoryStore};
    use std::time::Duration;

    fn pool(max_size: usize) -> ConnectionPool<MemoryManager> {
        let config = PoolConfig::new()
            .with_max_size(max_size)
            .with_wait_timeout(Duration::from_millis(100));
        ConnectionPool::new("test", MemoryManager::new(MemoryStore::new()), &config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_beyond_max_times_out() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            quill_core::QuillError::Storage(StorageError::PoolExhausted { ref pool, .. }) if pool == "test"
        ));
        held.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_unblocks_waiter() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.release()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().waiting, 1);

        held.release();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_live_borrowers_get_distinct_connections() {
        let pool = pool(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.connection().unwrap().id(), b.connection().unwrap().id());
        assert_eq!(pool.status().size, 2);
        assert_eq!(pool.status().available, 0);
    }

    #[tokio::test]
    async fn test_query_error_keeps_connection() {
        let pool = pool(1);
        let mut conn = pool.acquire().await.unwrap();
        let id = conn.connection().unwrap().id();
        assert!(conn.execute("NOT SQL", &[]).await.is_err());
        assert!(!conn.is_broken());
        conn.release();

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.connection().unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let pool = pool(1);
        let mut conn = pool.acquire().await.unwrap();
        let id = conn.connection().unwrap().id();

        pool.manager().store().restart();
        let err = conn.query("SELECT * FROM posts", &[]).await.unwrap_err();
        assert!(err.is_connection_broken());
        assert!(conn.is_broken());
        conn.release();

        let mut fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.connection().unwrap().id(), id);
        assert!(fresh.query("SELECT * FROM posts", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_maps_to_connect_failed() {
        let pool = pool(1);
        pool.manager().store().set_unavailable(true);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            quill_core::QuillError::Storage(StorageError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = pool(1);
        pool.close();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            quill_core::QuillError::Storage(StorageError::PoolClosed { .. })
        ));
        assert!(!pool.health().is_healthy());
    }
}
