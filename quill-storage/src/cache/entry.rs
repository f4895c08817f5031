//! Cached response payloads and the handles that lend them out.

use quill_core::ContentType;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A fully rendered response.
///
/// The body is owned by the entry and is never mutated once the entry has
/// been handed to the cache, so any number of handle holders may read it
/// concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    status: u16,
    content_type: ContentType,
    body: Box<[u8]>,
}

impl CacheEntry {
    pub fn new(status: u16, content_type: ContentType, body: impl Into<Box<[u8]>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    /// A `200 OK` entry.
    pub fn ok(content_type: ContentType, body: impl Into<Box<[u8]>>) -> Self {
        Self::new(200, content_type, body)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Bytes charged against the cache capacity.
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Counters shared between the cache and every entry it stores.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub loads: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub pending_disposal: AtomicU64,
    pub disposed: AtomicU64,
}

/// An entry as held by the cache index and by handles.
///
/// Memory is shared through `Arc`; `readers` counts outstanding
/// [`CacheHandle`]s separately so eviction can prefer unreferenced entries.
#[derive(Debug)]
pub(crate) struct StoredEntry {
    entry: CacheEntry,
    readers: AtomicUsize,
    evicted_while_read: AtomicBool,
    counters: Arc<CacheCounters>,
}

impl StoredEntry {
    pub(crate) fn new(entry: CacheEntry, counters: Arc<CacheCounters>) -> Arc<Self> {
        Arc::new(Self {
            entry,
            readers: AtomicUsize::new(0),
            evicted_while_read: AtomicBool::new(false),
            counters,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.entry.size()
    }

    pub(crate) fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Called when the index drops this entry. Must run before the index's
    /// `Arc` is released.
    pub(crate) fn mark_removed(&self) {
        if self.readers() > 0 && !self.evicted_while_read.swap(true, Ordering::AcqRel) {
            self.counters.pending_disposal.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for StoredEntry {
    fn drop(&mut self) {
        if *self.evicted_while_read.get_mut() {
            self.counters.pending_disposal.fetch_sub(1, Ordering::Relaxed);
        }
        self.counters.disposed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A reference-counted view of a cached response.
///
/// The entry stays alive while any handle exists, even if the cache evicts
/// it in the meantime. Dropping the handle releases it; [`release`] makes
/// the release explicit at the call site. Releasing twice is impossible
/// because `release` consumes the handle.
///
/// [`release`]: CacheHandle::release
#[derive(Debug)]
pub struct CacheHandle {
    stored: Arc<StoredEntry>,
}

impl CacheHandle {
    pub(crate) fn new(stored: Arc<StoredEntry>) -> Self {
        stored.readers.fetch_add(1, Ordering::AcqRel);
        Self { stored }
    }

    /// Release this handle.
    pub fn release(self) {
        drop(self);
    }

    /// Whether two handles view the same stored entry.
    pub fn same_entry(&self, other: &CacheHandle) -> bool {
        Arc::ptr_eq(&self.stored, &other.stored)
    }
}

impl Deref for CacheHandle {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.stored.entry
    }
}

impl Clone for CacheHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.stored))
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.stored.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size_is_body_length() {
        let entry = CacheEntry::ok(ContentType::Json, b"{\"a\":1}".to_vec());
        assert_eq!(entry.size(), 7);
        assert_eq!(entry.status(), 200);
        assert_eq!(entry.content_type(), ContentType::Json);
    }

    #[test]
    fn test_handles_track_readers() {
        let counters = Arc::new(CacheCounters::default());
        let stored = StoredEntry::new(CacheEntry::ok(ContentType::PlainText, b"x".to_vec()), counters);

        let first = CacheHandle::new(Arc::clone(&stored));
        let second = first.clone();
        assert_eq!(stored.readers(), 2);
        assert!(first.same_entry(&second));

        first.release();
        assert_eq!(stored.readers(), 1);
        drop(second);
        assert_eq!(stored.readers(), 0);
    }

    #[test]
    fn test_disposal_waits_for_last_handle() {
        let counters = Arc::new(CacheCounters::default());
        let stored = StoredEntry::new(
            CacheEntry::ok(ContentType::PlainText, b"body".to_vec()),
            Arc::clone(&counters),
        );
        let handle = CacheHandle::new(Arc::clone(&stored));

        // The index lets go of its reference while a reader is active.
        stored.mark_removed();
        drop(stored);
        assert_eq!(counters.pending_disposal.load(Ordering::Relaxed), 1);
        assert_eq!(counters.disposed.load(Ordering::Relaxed), 0);
        assert_eq!(handle.body(), b"body");

        handle.release();
        assert_eq!(counters.pending_disposal.load(Ordering::Relaxed), 0);
        assert_eq!(counters.disposed.load(Ordering::Relaxed), 1);
    }
}
