//! In-memory backing store.
//!
//! [`MemoryStore`] runs statements against a private in-memory SQLite
//! database, opened on first use with the service tables from
//! `memory_schema.sql`. Pool connections are lightweight handles that take
//! turns on that one database, so every connection of a store sees the same
//! rows.
//!
//! [`MemoryManager`] plugs the store into `deadpool`, so memory pools go
//! through the same acquire, recycle and replacement paths as PostgreSQL
//! pools. [`MemoryStore::restart`] breaks every open connection, the way a
//! database restart would. The rows survive it.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use quill_core::{QuillError, QuillResult, StorageError};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteColumn, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column as _, ConnectOptions, Executor as _, Row as _, Sqlite, TypeInfo as _, ValueRef as _};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use super::config::PoolConfig;
use super::connection::{Connection, RowCursor, SqlValue};
use super::connection_pool::ConnectionPool;
use super::shard::ShardedPools;

const SCHEMA: &str = include_str!("memory_schema.sql");

/// One in-memory database, shared by every connection of a pool.
#[derive(Debug, Default)]
pub struct MemoryStore {
    database: Mutex<Option<SqliteConnection>>,
    generation: AtomicU64,
    next_connection: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Break every open connection. New connections work normally.
    pub fn restart(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Make new connection attempts fail while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.next_connection.load(Ordering::Acquire)
    }

    /// Number of rows in `table`.
    pub async fn row_count(&self, table: &str) -> QuillResult<usize> {
        let mut database = self.database().await?;
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut *database)
            .await
            .map_err(statement_failed)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn connect(self: &Arc<Self>) -> QuillResult<MemoryConnection> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StorageError::ConnectionBroken {
                reason: "memory store is unavailable".to_string(),
            }
            .into());
        }
        Ok(MemoryConnection {
            id: self.next_connection.fetch_add(1, Ordering::AcqRel),
            generation: self.generation.load(Ordering::Acquire),
            store: Arc::clone(self),
        })
    }

    /// The database, opened and given the schema on first use.
    async fn database(&self) -> QuillResult<MappedMutexGuard<'_, SqliteConnection>> {
        let mut slot = self.database.lock().await;
        if slot.is_none() {
            *slot = Some(open_database().await?);
            debug!("opened in-memory database");
        }
        MutexGuard::try_map(slot, Option::as_mut).map_err(|_| {
            StorageError::ConnectionBroken {
                reason: "in-memory database is not open".to_string(),
            }
            .into()
        })
    }

    async fn execute(&self, sql: &str, args: &[SqlValue]) -> QuillResult<u64> {
        let mut database = self.database().await?;
        let result = bind_all(sqlx::query(sql), args)
            .execute(&mut *database)
            .await
            .map_err(statement_failed)?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, args: &[SqlValue]) -> QuillResult<RowCursor> {
        let mut database = self.database().await?;
        let rows = bind_all(sqlx::query(sql), args)
            .fetch_all(&mut *database)
            .await
            .map_err(statement_failed)?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let values = rows.iter().map(decode_row).collect::<QuillResult<Vec<_>>>()?;
        Ok(RowCursor::new(columns, values))
    }
}

async fn open_database() -> QuillResult<SqliteConnection> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(statement_failed)?;
    let mut database = options.connect().await.map_err(|err| StorageError::ConnectionBroken {
        reason: err.to_string(),
    })?;
    database
        .execute(sqlx::raw_sql(SCHEMA))
        .await
        .map_err(statement_failed)?;
    Ok(database)
}

// ============================================================================
// VALUE MAPPING
// ============================================================================

fn statement_failed(err: sqlx::Error) -> QuillError {
    let reason = err.to_string();
    if matches!(err, sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed) {
        StorageError::ConnectionBroken { reason }.into()
    } else {
        StorageError::QueryFailed { reason }.into()
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> QuillResult<Vec<SqlValue>> {
    row.columns().iter().map(|column| decode_column(row, column)).collect()
}

/// Declared `BOOLEAN` and `DATETIME` columns decode to their types; anything
/// else follows the stored value's class.
fn decode_column(row: &SqliteRow, column: &SqliteColumn) -> QuillResult<SqlValue> {
    let index = column.ordinal();
    let decode_failed = |err: sqlx::Error| -> QuillError {
        StorageError::RowDecode {
            column: column.name().to_string(),
            reason: err.to_string(),
        }
        .into()
    };

    let raw = row.try_get_raw(index).map_err(decode_failed)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let stored = raw.type_info().name().to_string();

    let value = match column.type_info().name() {
        "BOOLEAN" => SqlValue::Bool(row.try_get(index).map_err(decode_failed)?),
        "DATETIME" => SqlValue::Timestamp(row.try_get(index).map_err(decode_failed)?),
        _ => match stored.as_str() {
            "INTEGER" => SqlValue::Int(row.try_get(index).map_err(decode_failed)?),
            "BLOB" => SqlValue::Bytes(row.try_get(index).map_err(decode_failed)?),
            "REAL" => SqlValue::Text(row.try_get::<f64, _>(index).map_err(decode_failed)?.to_string()),
            _ => SqlValue::Text(row.try_get(index).map_err(decode_failed)?),
        },
    };
    Ok(value)
}

// ============================================================================
// CONNECTIONS AND MANAGER
// ============================================================================

/// A connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    generation: u64,
    store: Arc<MemoryStore>,
}

impl MemoryConnection {
    /// Identifier unique within the store.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_alive(&self) -> QuillResult<()> {
        if self.is_broken() {
            return Err(StorageError::ConnectionBroken {
                reason: format!("connection {} was terminated", self.id),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, sql: &str, args: &[SqlValue]) -> QuillResult<u64> {
        self.check_alive()?;
        self.store.execute(sql, args).await
    }

    async fn query(&self, sql: &str, args: &[SqlValue]) -> QuillResult<RowCursor> {
        self.check_alive()?;
        self.store.query(sql, args).await
    }

    fn is_broken(&self) -> bool {
        self.generation != self.store.generation.load(Ordering::Acquire)
    }
}

/// `deadpool` manager opening [`MemoryConnection`]s to one store.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    store: Arc<MemoryStore>,
}

impl MemoryManager {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl managed::Manager for MemoryManager {
    type Type = MemoryConnection;
    type Error = QuillError;

    async fn create(&self) -> Result<MemoryConnection, QuillError> {
        self.store.connect()
    }

    async fn recycle(&self, conn: &mut MemoryConnection, _: &Metrics) -> RecycleResult<QuillError> {
        if conn.is_broken() {
            debug!(connection = conn.id, "memory connection terminated, not reused");
            return Err(RecycleError::Backend(
                StorageError::ConnectionBroken {
                    reason: "connection terminated".to_string(),
                }
                .into(),
            ));
        }
        Ok(())
    }
}

impl ConnectionPool<MemoryManager> {
    /// A pool over `store`.
    pub fn memory(name: impl Into<String>, store: Arc<MemoryStore>, config: &PoolConfig) -> QuillResult<Self> {
        Self::new(name, MemoryManager::new(store), config)
    }
}

impl ShardedPools<MemoryManager> {
    /// Pools over `shard_count` independent stores plus an accounts store.
    pub fn memory(shard_count: usize, config: &PoolConfig) -> QuillResult<Self> {
        let shards = (0..shard_count)
            .map(|n| ConnectionPool::memory(format!("shard-{}", n), MemoryStore::new(), config))
            .collect::<QuillResult<Vec<_>>>()?;
        let accounts = ConnectionPool::memory("accounts", MemoryStore::new(), config)?;
        Self::new(shards, accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn connection() -> MemoryConnection {
        MemoryStore::new().connect().unwrap()
    }

    async fn seed(conn: &MemoryConnection) {
        for (id, tenant, title) in [(1, 10, "a"), (2, 10, "b"), (3, 20, "c"), (4, 10, "d")] {
            conn.execute(
                "INSERT INTO posts (post_id, tenant_id, title) VALUES ($1, $2, $3)",
                &[SqlValue::Int(id), SqlValue::Int(tenant), title.into()],
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_pages() {
        let conn = connection();
        seed(&conn).await;

        let titles: Vec<String> = conn
            .query(
                "SELECT title FROM posts WHERE tenant_id = $1 ORDER BY post_id DESC LIMIT $2 OFFSET $3",
                &[SqlValue::Int(10), SqlValue::Int(2), SqlValue::Int(1)],
            )
            .await
            .unwrap()
            .map(|row| row.get_str("title").unwrap().to_string())
            .collect();
        assert_eq!(titles, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_values_decode_by_column_type() {
        let conn = connection();
        let created_at = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
        conn.execute(
            "INSERT INTO posts (post_id, tenant_id, author_id, title, body, published, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                SqlValue::Int(9),
                SqlValue::Int(1),
                SqlValue::Int(2),
                "Title".into(),
                SqlValue::Null,
                true.into(),
                created_at.into(),
            ],
        )
        .await
        .unwrap();

        let row = conn
            .query(
                "SELECT post_id, title, body, published, created_at FROM posts WHERE published = $1",
                &[true.into()],
            )
            .await
            .unwrap()
            .single()
            .unwrap();
        assert_eq!(row.columns(), ["post_id", "title", "body", "published", "created_at"]);
        assert_eq!(row.get_i64("post_id").unwrap(), 9);
        assert_eq!(row.get_str("title").unwrap(), "Title");
        assert!(row.get("body").unwrap().is_null());
        assert!(row.get_bool("published").unwrap());
        assert_eq!(row.get_timestamp("created_at").unwrap(), created_at);
    }

    #[tokio::test]
    async fn test_delete_counts_changes() {
        let conn = connection();
        seed(&conn).await;
        let changed = conn
            .execute("DELETE FROM posts WHERE tenant_id = $1", &[SqlValue::Int(10)])
            .await
            .unwrap();
        assert_eq!(changed, 3);
        assert_eq!(conn.store.row_count("posts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_statements_are_query_errors() {
        let conn = connection();
        for (sql, args) in [
            ("INSERT INTO posts (post_id) VALUES ($1)", &[][..]),
            ("SELECT * FROM missing", &[][..]),
            ("NOT SQL", &[][..]),
        ] {
            let err = conn.execute(sql, args).await.unwrap_err();
            assert!(
                matches!(err, QuillError::Storage(StorageError::QueryFailed { .. })),
                "{sql}: {err}"
            );
        }
        // The connection stays usable after a failed statement.
        assert!(conn.query("SELECT * FROM posts", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_connections_share_one_database() {
        let store = MemoryStore::new();
        let writer = store.connect().unwrap();
        let reader = store.connect().unwrap();
        seed(&writer).await;

        let rows = reader.query("SELECT post_id FROM posts", &[]).await.unwrap();
        assert_eq!(rows.remaining(), 4);
        assert_eq!(MemoryStore::new().row_count("posts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restart_breaks_open_connections() {
        let store = MemoryStore::new();
        let conn = store.connect().unwrap();
        seed(&conn).await;
        store.restart();
        assert!(conn.is_broken());
        let err = conn.query("SELECT * FROM posts", &[]).await.unwrap_err();
        assert!(err.is_connection_broken());

        let fresh = store.connect().unwrap();
        assert!(!fresh.is_broken());
        assert_eq!(store.row_count("posts").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_store_refuses_connections() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.connect().unwrap_err().is_connection_broken());
        store.set_unavailable(false);
        assert!(store.connect().is_ok());
        assert_eq!(store.connections_opened(), 1);
    }
}
