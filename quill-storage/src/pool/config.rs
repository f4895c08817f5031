//! Connection pool configuration.

use std::time::Duration;

use quill_core::{ConfigError, QuillResult, ShardId};

/// Sizing and timeouts shared by every pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of connections a pool opens.
    pub max_size: usize,
    /// How long `acquire` waits for a free connection before failing.
    pub wait_timeout: Duration,
    /// How long opening a new connection may take.
    pub create_timeout: Duration,
    /// How long the reuse check on a returned connection may take.
    pub recycle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            wait_timeout: Duration::from_secs(5),
            create_timeout: Duration::from_secs(5),
            recycle_timeout: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load pool configuration from environment variables.
    ///
    /// - `QUILL_DB_POOL_SIZE` (default: 16)
    /// - `QUILL_DB_WAIT_TIMEOUT_MS` (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_size: std::env::var("QUILL_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            wait_timeout: std::env::var("QUILL_DB_WAIT_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_timeout),
            ..defaults
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn validate(&self) -> QuillResult<()> {
        if self.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_size".to_string(),
                value: self.max_size.to_string(),
                reason: "max_size must be greater than 0".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn timeouts(&self) -> deadpool::managed::Timeouts {
        let mut timeouts = deadpool::managed::Timeouts::default();
        timeouts.wait = Some(self.wait_timeout);
        timeouts.create = Some(self.create_timeout);
        timeouts.recycle = Some(self.recycle_timeout);
        timeouts
    }
}

/// Connection settings for one PostgreSQL database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
}

impl DbConfig {
    fn with_dbname(dbname: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: dbname.into(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }

    /// Load a database configuration from `{prefix}_HOST`, `{prefix}_PORT`,
    /// `{prefix}_NAME`, `{prefix}_USER` and `{prefix}_PASSWORD`.
    pub fn from_env_prefixed(prefix: &str, default_dbname: &str) -> Self {
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();
        let defaults = Self::with_dbname(default_dbname);
        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: var("PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: var("NAME").unwrap_or(defaults.dbname),
            user: var("USER").unwrap_or(defaults.user),
            password: var("PASSWORD").unwrap_or(defaults.password),
        }
    }
}

/// Databases of every shard plus the accounts database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    /// One entry per shard, indexed by [`ShardId::index`].
    pub shards: Vec<DbConfig>,
    pub accounts: DbConfig,
    pub pool: PoolConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shards: vec![DbConfig::with_dbname(Self::shard_dbname(ShardId::new(0)))],
            accounts: DbConfig::with_dbname("quill_accounts"),
            pool: PoolConfig::default(),
        }
    }
}

impl ShardConfig {
    fn shard_dbname(shard: ShardId) -> String {
        format!("quill_shard{}", shard.as_u16())
    }

    /// Load shard configuration from environment variables.
    ///
    /// - `QUILL_SHARD_COUNT` (default: 1)
    /// - `QUILL_SHARD{n}_HOST`, `_PORT`, `_NAME`, `_USER`, `_PASSWORD` per shard
    /// - `QUILL_ACCOUNTS_HOST`, `_PORT`, `_NAME`, `_USER`, `_PASSWORD`
    /// - pool settings as in [`PoolConfig::from_env`]
    pub fn from_env() -> Self {
        let shard_count: u16 = std::env::var("QUILL_SHARD_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        let shards = (0..shard_count)
            .map(ShardId::new)
            .map(|shard| {
                DbConfig::from_env_prefixed(
                    &format!("QUILL_SHARD{}", shard.as_u16()),
                    &Self::shard_dbname(shard),
                )
            })
            .collect();
        Self {
            shards,
            accounts: DbConfig::from_env_prefixed("QUILL_ACCOUNTS", "quill_accounts"),
            pool: PoolConfig::from_env(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn validate(&self) -> QuillResult<()> {
        if self.shards.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "shard_count".to_string(),
                value: "0".to_string(),
                reason: "at least one shard is required".to_string(),
            }
            .into());
        }
        self.pool.validate()
    }
}
