//! PostgreSQL backend over `deadpool-postgres`.
//!
//! Statements are prepared through the per-connection statement cache.
//! Errors on a closed client are reported as
//! [`StorageError::ConnectionBroken`]; the manager's `Fast` recycling method
//! also drops closed clients before they are handed out again.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use deadpool_postgres::{ClientWrapper, Config, Manager, ManagerConfig, RecyclingMethod, Runtime};
use postgres_types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use quill_core::{ConfigError, QuillError, QuillResult, ShardId, StorageError};
use tokio_postgres::NoTls;
use tracing::info;

use super::config::{DbConfig, PoolConfig, ShardConfig};
use super::connection::{Connection, RowCursor, SqlValue};
use super::connection_pool::ConnectionPool;
use super::shard::ShardedPools;

type BoxError = Box<dyn StdError + Sync + Send>;

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => {
                if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for SqlValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if *ty == Type::BOOL {
            bool::from_sql(ty, raw).map(SqlValue::Bool)
        } else if *ty == Type::INT2 {
            i16::from_sql(ty, raw).map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT4 {
            i32::from_sql(ty, raw).map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT8 {
            i64::from_sql(ty, raw).map(SqlValue::Int)
        } else if *ty == Type::BYTEA {
            Vec::<u8>::from_sql(ty, raw).map(SqlValue::Bytes)
        } else if *ty == Type::TIMESTAMPTZ {
            DateTime::<Utc>::from_sql(ty, raw).map(SqlValue::Timestamp)
        } else if <String as FromSql>::accepts(ty) {
            String::from_sql(ty, raw).map(SqlValue::Text)
        } else {
            Err(format!("unsupported column type {}", ty).into())
        }
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(SqlValue::Null)
    }

    fn accepts(ty: &Type) -> bool {
        [Type::BOOL, Type::INT2, Type::INT4, Type::INT8, Type::BYTEA, Type::TIMESTAMPTZ].contains(ty)
            || <String as FromSql>::accepts(ty)
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> QuillError {
    if err.is_closed() {
        StorageError::ConnectionBroken {
            reason: err.to_string(),
        }
        .into()
    } else {
        StorageError::QueryFailed {
            reason: err.to_string(),
        }
        .into()
    }
}

fn params(args: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

fn decode_row(row: &tokio_postgres::Row) -> QuillResult<Vec<SqlValue>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            row.try_get::<_, SqlValue>(i).map_err(|e| {
                StorageError::RowDecode {
                    column: column.name().to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
        })
        .collect()
}

#[async_trait]
impl Connection for ClientWrapper {
    async fn execute(&self, sql: &str, args: &[SqlValue]) -> QuillResult<u64> {
        let statement = self.prepare_cached(sql).await.map_err(map_pg_error)?;
        let client: &tokio_postgres::Client = self;
        client
            .execute(&statement, &params(args))
            .await
            .map_err(map_pg_error)
    }

    async fn query(&self, sql: &str, args: &[SqlValue]) -> QuillResult<RowCursor> {
        let statement = self.prepare_cached(sql).await.map_err(map_pg_error)?;
        let client: &tokio_postgres::Client = self;
        let rows = client
            .query(&statement, &params(args))
            .await
            .map_err(map_pg_error)?;

        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let values = rows.iter().map(decode_row).collect::<QuillResult<Vec<_>>>()?;
        Ok(RowCursor::new(columns, values))
    }

    fn is_broken(&self) -> bool {
        self.is_closed()
    }
}

impl DbConfig {
    fn to_deadpool(&self, pool: &PoolConfig) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = deadpool_postgres::PoolConfig::new(pool.max_size);
        pool_cfg.timeouts = pool.timeouts();
        cfg.pool = Some(pool_cfg);
        cfg
    }
}

impl ConnectionPool<Manager> {
    /// A pool of PostgreSQL connections. Connections open lazily on first use.
    pub fn postgres(name: impl Into<String>, db: &DbConfig, pool: &PoolConfig) -> QuillResult<Self> {
        pool.validate()?;
        let name: String = name.into();
        let built = db
            .to_deadpool(pool)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ConfigError::InvalidValue {
                field: "pool".to_string(),
                value: name.clone(),
                reason: format!("Failed to create pool: {}", e),
            })?;
        info!(pool = %name, host = %db.host, dbname = %db.dbname, max_size = pool.max_size, "PostgreSQL pool created");
        Ok(Self::from_pool(name, built))
    }
}

impl ShardedPools<Manager> {
    /// Pools for every configured shard and the accounts database.
    pub fn postgres(config: &ShardConfig) -> QuillResult<Self> {
        config.validate()?;
        let shards = config
            .shards
            .iter()
            .enumerate()
            .map(|(n, db)| {
                let shard = u16::try_from(n).map(ShardId::new).map_err(|_| ConfigError::InvalidValue {
                    field: "shard_count".to_string(),
                    value: config.shards.len().to_string(),
                    reason: "too many shards".to_string(),
                })?;
                ConnectionPool::postgres(shard.to_string(), db, &config.pool)
            })
            .collect::<QuillResult<Vec<_>>>()?;
        let accounts = ConnectionPool::postgres("accounts", &config.accounts, &config.pool)?;
        Self::new(shards, accounts)
    }
}
