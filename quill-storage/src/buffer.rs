//! Reusable scratch buffers for building response bodies.
//!
//! A handler borrows a [`PooledBuffer`], renders into it, copies the result
//! into an owned body with [`PooledBuffer::copy`] and drops the buffer. The
//! buffer goes back to the pool with its contents cleared and its capacity
//! kept, so steady-state rendering does not allocate scratch space.
//!
//! The pool is elastic: `acquire` never waits. When no pooled buffer is free
//! a new one is allocated, and surplus buffers are dropped on return.

use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quill_core::{ConfigError, QuillResult};
use serde::Serialize;
use tracing::trace;

/// Buffer pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Most buffers kept on the free list.
    pub max_pooled: usize,
    /// Capacity of freshly allocated buffers.
    pub initial_capacity: usize,
    /// Buffers that grew beyond this are freed instead of pooled.
    pub max_retained_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_pooled: 64,
            initial_capacity: 8 * 1024,
            max_retained_capacity: 1024 * 1024,
        }
    }
}

impl BufferPoolConfig {
    /// Load buffer pool configuration from environment variables.
    ///
    /// - `QUILL_BUFFER_MAX_POOLED` (default: 64)
    /// - `QUILL_BUFFER_INITIAL_CAPACITY` (default: 8 KiB)
    /// - `QUILL_BUFFER_MAX_RETAINED` (default: 1 MiB)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };
        Self {
            max_pooled: var("QUILL_BUFFER_MAX_POOLED", defaults.max_pooled),
            initial_capacity: var("QUILL_BUFFER_INITIAL_CAPACITY", defaults.initial_capacity),
            max_retained_capacity: var("QUILL_BUFFER_MAX_RETAINED", defaults.max_retained_capacity),
        }
    }

    pub fn with_max_pooled(mut self, max_pooled: usize) -> Self {
        self.max_pooled = max_pooled;
        self
    }

    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn with_max_retained_capacity(mut self, capacity: usize) -> Self {
        self.max_retained_capacity = capacity;
        self
    }

    pub fn validate(&self) -> QuillResult<()> {
        if self.initial_capacity > self.max_retained_capacity {
            return Err(ConfigError::InvalidValue {
                field: "initial_capacity".to_string(),
                value: self.initial_capacity.to_string(),
                reason: format!(
                    "initial_capacity must not exceed max_retained_capacity ({})",
                    self.max_retained_capacity
                ),
            }
            .into());
        }
        Ok(())
    }
}

/// Buffer pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    /// Buffers handed out.
    pub acquired: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
    /// Acquisitions that allocated a new buffer.
    pub allocated: u64,
    /// Buffers on the free list right now.
    pub pooled: usize,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    reused: AtomicU64,
    allocated: AtomicU64,
}

/// A pool of growable byte buffers, safe to share across tasks.
#[derive(Debug)]
pub struct BufferPool {
    config: BufferPoolConfig,
    free: Mutex<Vec<Vec<u8>>>,
    counters: Counters,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> QuillResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(config.max_pooled)),
            config,
            counters: Counters::default(),
        }))
    }

    /// Borrow an empty buffer.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        // A poisoned free list only loses pooling, never correctness.
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        let buf = match reused {
            Some(mut buf) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            None => {
                self.counters.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.config.initial_capacity)
            }
        };
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.config.max_retained_capacity {
            trace!(capacity = buf.capacity(), "dropping oversized buffer");
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.config.max_pooled {
                free.push(buf);
            }
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            pooled: self.free.lock().map(|free| free.len()).unwrap_or(0),
        }
    }
}

/// A buffer borrowed from a [`BufferPool`]. Returned to the pool on drop.
///
/// Cache entries must not alias pooled memory: take an owned copy with
/// [`copy`](PooledBuffer::copy) before the buffer is dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Append `bytes`.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// An owned copy of the contents, sized exactly.
    pub fn copy(&self) -> Box<[u8]> {
        Box::from(self.buf.as_slice())
    }

    /// Return the buffer to its pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl io::Write for PooledBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}
