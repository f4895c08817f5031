//! Service Configuration
//!
//! All settings are read once at startup from `QUILL_*` environment
//! variables and handed to [`AppState`](crate::AppState) explicitly.

use quill_core::{ConfigError, QuillResult};
use quill_storage::{BufferPoolConfig, CacheConfig, ShardConfig};

/// Upper bound on the page size a deployment may configure.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Shard and accounts databases plus pool sizing.
    pub shards: ShardConfig,
    /// Scratch buffer pool settings.
    pub buffers: BufferPoolConfig,
    /// Posts per page in list views.
    pub page_size: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            shards: ShardConfig::default(),
            buffers: BufferPoolConfig::default(),
            page_size: 20,
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from environment variables.
    ///
    /// Each section reads its own variables; see [`CacheConfig::from_env`],
    /// [`ShardConfig::from_env`] and [`BufferPoolConfig::from_env`].
    /// `QUILL_PAGE_SIZE` sets the list page size (default: 20).
    pub fn from_env() -> Self {
        let page_size = std::env::var("QUILL_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);

        Self {
            cache: CacheConfig::from_env(),
            shards: ShardConfig::from_env(),
            buffers: BufferPoolConfig::from_env(),
            page_size,
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_shards(mut self, shards: ShardConfig) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_buffers(mut self, buffers: BufferPoolConfig) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> QuillResult<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "page_size".to_string(),
                value: self.page_size.to_string(),
                reason: format!("page_size must be between 1 and {}", MAX_PAGE_SIZE),
            }
            .into());
        }
        self.cache.validate()?;
        self.shards.validate()?;
        self.buffers.validate()?;
        Ok(())
    }
}
