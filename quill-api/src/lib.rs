//! Quill API - Handlers, Rendering and Service Wiring
//!
//! This crate ties the storage layer together the way request handlers use
//! it: tenant resolution, cache key derivation, cached rendering of post
//! lists, posts, comment lists and tenant profiles, and write-then-invalidate
//! for new posts and comments. It also owns service configuration, error
//! mapping to HTTP status codes and logging setup.
//!
//! HTTP routing is left to the embedding server; every handler is an async
//! method on [`AppState`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod render;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use state::{AppState, MemoryAppState, PgAppState, ServiceHealth};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
