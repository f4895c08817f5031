//! Shared response cache.
//!
//! Rendered responses are cached under a [`CacheKey`] that encodes the
//! tenant and every rendering parameter, so a key can never be built without
//! a tenant scope and two requests that would render different bytes never
//! share an entry.
//!
//! [`ResponseCache::fetch`] is the only read path: it returns a
//! [`CacheHandle`] for a live entry or runs the caller's loader, making sure
//! at most one loader per key is in flight at a time.
//!
//! # Example
//!
//! ```ignore
//! let key = CacheKey::post_list(tenant.tenant_id, page, flags);
//! let handle = cache
//!     .fetch(key, render_post_list, (state.clone(), tenant, page, flags), cache.default_options())
//!     .await?;
//! if let Some(response) = handle {
//!     write_response(response.status(), response.content_type(), response.body());
//!     response.release();
//! }
//! ```

pub mod entry;
pub mod key;
pub mod response_cache;
pub mod stats;

pub use entry::{CacheEntry, CacheHandle};
pub use key::{CacheKey, ResponseKind};
pub use response_cache::{CacheConfig, FetchOptions, ResponseCache};
pub use stats::CacheStats;
