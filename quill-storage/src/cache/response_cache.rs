//! Size-bounded, TTL-expiring, single-flight response cache.
//!
//! Handlers call [`ResponseCache::fetch`] with a [`CacheKey`] and a loader.
//! A live entry is returned immediately. On a miss exactly one caller, the
//! leader, runs the loader while every other caller for the same key waits
//! for the leader's outcome. The loader runs on its own task, so a leader
//! whose request is dropped still populates the cache for the waiters.
//!
//! The index lock is held only to decide hit, lead or wait and to publish a
//! finished entry. It is never held while a loader runs.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use quill_core::{CacheError, ConfigError, QuillResult, StorageError, TenantId};
use quill_core::QuillError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::entry::{CacheCounters, CacheEntry, CacheHandle, StoredEntry};
use super::key::CacheKey;
use super::stats::CacheStats;

/// Configuration for the response cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Upper bound on the summed `size()` of indexed entries.
    pub capacity_bytes: usize,
    /// TTL used by [`FetchOptions::default`].
    pub default_ttl: Duration,
    /// Longest a loader may run before the fetch fails.
    pub load_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            load_timeout: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load cache configuration from environment variables.
    ///
    /// - `QUILL_CACHE_CAPACITY_BYTES` (default: 64 MiB)
    /// - `QUILL_CACHE_DEFAULT_TTL_SECS` (default: 300)
    /// - `QUILL_CACHE_LOAD_TIMEOUT_MS` (default: 10000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capacity_bytes: std::env::var("QUILL_CACHE_CAPACITY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.capacity_bytes),
            default_ttl: std::env::var("QUILL_CACHE_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            load_timeout: std::env::var("QUILL_CACHE_LOAD_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.load_timeout),
        }
    }

    /// Set the capacity in bytes.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the loader timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn validate(&self) -> QuillResult<()> {
        if self.capacity_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "capacity_bytes".to_string(),
                value: self.capacity_bytes.to_string(),
                reason: "capacity_bytes must be greater than 0".to_string(),
            }
            .into());
        }
        if self.load_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "load_timeout".to_string(),
                value: format!("{:?}", self.load_timeout),
                reason: "load_timeout must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Per-call options for [`ResponseCache::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// How long a freshly loaded entry stays live.
    pub ttl: Duration,
}

impl FetchOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl_secs(secs: u64) -> Self {
        Self::ttl(Duration::from_secs(secs))
    }
}

/// Result of one loader run, shared with every waiter.
#[derive(Debug, Clone)]
enum LoadOutcome {
    Found(Arc<StoredEntry>),
    NotFound,
    Failed(QuillError),
}

impl LoadOutcome {
    fn into_handle(self) -> QuillResult<Option<CacheHandle>> {
        match self {
            LoadOutcome::Found(stored) => Ok(Some(CacheHandle::new(stored))),
            LoadOutcome::NotFound => Ok(None),
            LoadOutcome::Failed(err) => Err(err),
        }
    }
}

type OutcomeReceiver = watch::Receiver<Option<LoadOutcome>>;

enum Role {
    Leader(watch::Sender<Option<LoadOutcome>>),
    Waiter(OutcomeReceiver),
}

struct Slot {
    stored: Arc<StoredEntry>,
    expires_at: Instant,
    tick: u64,
}

/// Key → entry map with recency order and in-flight computations.
#[derive(Default)]
struct CacheIndex {
    entries: HashMap<CacheKey, Slot>,
    /// Recency order: smallest tick is least recently used.
    recency: BTreeMap<u64, CacheKey>,
    pending: HashMap<CacheKey, OutcomeReceiver>,
    used_bytes: usize,
    next_tick: u64,
}

impl CacheIndex {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Return a handle to a live entry, dropping it instead if expired.
    fn lookup(&mut self, key: &CacheKey, now: Instant, counters: &CacheCounters) -> Option<CacheHandle> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(slot) => now > slot.expires_at,
        };
        if expired {
            self.remove(key);
            counters.expirations.fetch_add(1, Ordering::Relaxed);
            trace!(?key, "expired cache entry dropped on lookup");
            return None;
        }

        let tick = self.tick();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        self.recency.insert(tick, *key);
        Some(CacheHandle::new(Arc::clone(&slot.stored)))
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Arc<StoredEntry>> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        self.used_bytes -= slot.stored.size();
        slot.stored.mark_removed();
        Some(slot.stored)
    }

    /// Index `stored` under `key`, evicting as needed.
    ///
    /// Returns `false` when the entry is larger than the whole capacity and
    /// was left unindexed.
    fn insert(
        &mut self,
        key: CacheKey,
        stored: Arc<StoredEntry>,
        expires_at: Instant,
        capacity: usize,
        counters: &CacheCounters,
    ) -> bool {
        self.remove(&key);

        let size = stored.size();
        if size > capacity {
            debug!(?key, size, capacity, "entry larger than cache capacity, not indexed");
            return false;
        }
        self.make_room(size, capacity, Instant::now(), counters);

        let tick = self.tick();
        self.recency.insert(tick, key);
        self.used_bytes += size;
        self.entries.insert(
            key,
            Slot {
                stored,
                expires_at,
                tick,
            },
        );
        true
    }

    fn make_room(&mut self, needed: usize, capacity: usize, now: Instant, counters: &CacheCounters) {
        if self.used_bytes + needed <= capacity {
            return;
        }

        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, slot)| now > slot.expires_at)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.remove(&key);
            counters.expirations.fetch_add(1, Ordering::Relaxed);
        }

        while self.used_bytes + needed > capacity {
            // Least recently used unreferenced entry first, then the least
            // recently used entry overall.
            let victim = self
                .recency
                .values()
                .find(|key| {
                    self.entries
                        .get(*key)
                        .is_some_and(|slot| slot.stored.readers() == 0)
                })
                .or_else(|| self.recency.values().next())
                .copied();
            let Some(victim) = victim else { break };
            if let Some(stored) = self.remove(&victim) {
                counters.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?victim, size = stored.size(), readers = stored.readers(), "evicted cache entry");
            }
        }
    }
}

struct CacheInner {
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    counters: Arc<CacheCounters>,
}

impl CacheInner {
    fn lock_index(&self) -> QuillResult<MutexGuard<'_, CacheIndex>> {
        self.index
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Publish a finished load: clear the pending marker and index a found
    /// entry in one critical section, so later callers see one or the other.
    fn complete(
        &self,
        key: CacheKey,
        outcome: &LoadOutcome,
        ttl: Duration,
        ours: &OutcomeReceiver,
    ) -> QuillResult<Option<CacheHandle>> {
        let mut index = self.lock_index()?;
        // An invalidation during the load detaches its marker; the result is
        // then handed to the callers that shared it but never indexed.
        let current = index.pending.get(&key).is_some_and(|r| r.same_channel(ours));
        if current {
            index.pending.remove(&key);
        }
        match outcome {
            LoadOutcome::Found(stored) => {
                // The leader's reference exists before the entry is visible.
                let handle = CacheHandle::new(Arc::clone(stored));
                if current {
                    let expires_at = Instant::now() + ttl;
                    index.insert(
                        key,
                        Arc::clone(stored),
                        expires_at,
                        self.config.capacity_bytes,
                        &self.counters,
                    );
                } else {
                    debug!(?key, "cache invalidated during load, result not indexed");
                }
                Ok(Some(handle))
            }
            LoadOutcome::NotFound => Ok(None),
            LoadOutcome::Failed(err) => Err(err.clone()),
        }
    }
}

/// Clears a pending marker if its loader task dies without publishing.
struct PendingGuard {
    inner: Arc<CacheInner>,
    key: CacheKey,
    ours: OutcomeReceiver,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut index) = self.inner.index.lock() {
            if index.pending.get(&self.key).is_some_and(|r| r.same_channel(&self.ours)) {
                index.pending.remove(&self.key);
            }
        }
    }
}

/// Shared, single-flight cache of rendered responses.
///
/// Cloning is cheap; clones share one index.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl ResponseCache {
    /// Create a cache from a validated configuration.
    pub fn new(config: CacheConfig) -> QuillResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                index: Mutex::new(CacheIndex::default()),
                counters: Arc::new(CacheCounters::default()),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Options carrying the configured default TTL.
    pub fn default_options(&self) -> FetchOptions {
        FetchOptions::ttl(self.inner.config.default_ttl)
    }

    /// Return the entry for `key`, computing it with `loader(arg)` on a miss.
    ///
    /// - A live entry is returned without calling the loader.
    /// - On a miss, at most one loader runs per key; concurrent callers for
    ///   the same key share its outcome.
    /// - `Ok(None)` from the loader means "not found": nothing is cached and
    ///   `fetch` returns `Ok(None)`.
    /// - Loader errors propagate to every caller sharing the computation and
    ///   are never cached.
    ///
    /// The returned handle must be released (or dropped) once the response
    /// has been written.
    pub async fn fetch<A, F, Fut>(
        &self,
        key: CacheKey,
        loader: F,
        arg: A,
        options: FetchOptions,
    ) -> QuillResult<Option<CacheHandle>>
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = QuillResult<Option<CacheEntry>>> + Send + 'static,
    {
        let mut job = Some((loader, arg));
        loop {
            let role = {
                let mut index = self.inner.lock_index()?;
                if let Some(handle) = index.lookup(&key, Instant::now(), &self.inner.counters) {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(handle));
                }
                match index.pending.get(&key) {
                    Some(receiver) => Role::Waiter(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        index.pending.insert(key, receiver);
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Leader(sender) => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    let Some((loader, arg)) = job.take() else {
                        return Err(CacheError::LoaderAborted.into());
                    };
                    return self.lead(key, loader, arg, options, sender).await;
                }
                Role::Waiter(receiver) => {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    if let Some(outcome) = Self::wait(receiver).await {
                        return outcome.into_handle();
                    }
                    debug!(?key, "cache loader vanished without a result, retrying");
                }
            }
        }
    }

    async fn lead<A, F, Fut>(
        &self,
        key: CacheKey,
        loader: F,
        arg: A,
        options: FetchOptions,
        sender: watch::Sender<Option<LoadOutcome>>,
    ) -> QuillResult<Option<CacheHandle>>
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = QuillResult<Option<CacheEntry>>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let guard = PendingGuard {
                inner: Arc::clone(&inner),
                key,
                ours: sender.subscribe(),
            };
            let load_timeout = inner.config.load_timeout;

            let outcome = match tokio::time::timeout(load_timeout, loader(arg)).await {
                Ok(Ok(Some(entry))) => {
                    inner.counters.loads.fetch_add(1, Ordering::Relaxed);
                    LoadOutcome::Found(StoredEntry::new(entry, Arc::clone(&inner.counters)))
                }
                Ok(Ok(None)) => LoadOutcome::NotFound,
                Ok(Err(err)) => {
                    debug!(?key, error = %err, "cache loader failed");
                    LoadOutcome::Failed(err)
                }
                Err(_) => {
                    warn!(?key, timeout_ms = load_timeout.as_millis() as u64, "cache loader timed out");
                    LoadOutcome::Failed(
                        CacheError::LoadTimeout {
                            waited_ms: load_timeout.as_millis() as u64,
                        }
                        .into(),
                    )
                }
            };

            let result = inner.complete(key, &outcome, options.ttl, &guard.ours);
            let published = match &result {
                Err(err) if matches!(outcome, LoadOutcome::Found(_)) => LoadOutcome::Failed(err.clone()),
                _ => outcome,
            };
            sender.send_replace(Some(published));
            result
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                warn!(?key, error = %err, "cache loader task aborted");
                Err(CacheError::LoaderAborted.into())
            }
        }
    }

    async fn wait(mut receiver: OutcomeReceiver) -> Option<LoadOutcome> {
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }

    /// Store an entry directly, replacing any entry for `key`.
    ///
    /// Used to warm the cache after a write. Returns `false` if the entry is
    /// larger than the cache capacity and was not stored.
    pub fn put(&self, key: CacheKey, entry: CacheEntry, ttl: Duration) -> QuillResult<bool> {
        let stored = StoredEntry::new(entry, Arc::clone(&self.inner.counters));
        let mut index = self.inner.lock_index()?;
        Ok(index.insert(
            key,
            stored,
            Instant::now() + ttl,
            self.inner.config.capacity_bytes,
            &self.inner.counters,
        ))
    }

    /// Remove the entry for `key`. Outstanding handles stay readable.
    ///
    /// A load for `key` already in flight still answers its callers, but its
    /// result is not indexed.
    pub fn invalidate(&self, key: &CacheKey) -> QuillResult<bool> {
        let mut index = self.inner.lock_index()?;
        index.pending.remove(key);
        Ok(index.remove(key).is_some())
    }

    /// Remove every entry belonging to `tenant_id`, returning how many were
    /// indexed. In-flight loads for the tenant are detached as in
    /// [`invalidate`](Self::invalidate).
    pub fn invalidate_tenant(&self, tenant_id: TenantId) -> QuillResult<usize> {
        let mut index = self.inner.lock_index()?;
        index.pending.retain(|key, _| !key.belongs_to(tenant_id));
        let keys: Vec<CacheKey> = index
            .entries
            .keys()
            .filter(|key| key.belongs_to(tenant_id))
            .copied()
            .collect();
        for key in &keys {
            index.remove(key);
        }
        debug!(tenant = %tenant_id, removed = keys.len(), "invalidated tenant cache entries");
        Ok(keys.len())
    }

    /// Number of indexed entries, including expired ones not yet swept.
    pub fn len(&self) -> QuillResult<usize> {
        Ok(self.inner.lock_index()?.entries.len())
    }

    pub fn is_empty(&self) -> QuillResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether a live entry for `key` is indexed. Does not touch recency.
    pub fn contains(&self, key: &CacheKey) -> QuillResult<bool> {
        let index = self.inner.lock_index()?;
        let now = Instant::now();
        Ok(index.entries.get(key).is_some_and(|slot| now <= slot.expires_at))
    }

    pub fn stats(&self) -> QuillResult<CacheStats> {
        let (entry_count, memory_bytes) = {
            let index = self.inner.lock_index()?;
            (index.entries.len() as u64, index.used_bytes as u64)
        };
        let counters = &self.inner.counters;
        Ok(CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            expirations: counters.expirations.load(Ordering::Relaxed),
            entry_count,
            memory_bytes,
            pending_disposal: counters.pending_disposal.load(Ordering::Relaxed),
            disposed: counters.disposed.load(Ordering::Relaxed),
        })
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
