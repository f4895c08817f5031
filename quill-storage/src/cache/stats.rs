//! Cache usage statistics.

use serde::Serialize;

/// Point-in-time statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Fetches served from a live entry.
    pub hits: u64,
    /// Fetches that started a load.
    pub misses: u64,
    /// Fetches that joined a load already in flight.
    pub coalesced: u64,
    /// Loads that produced an entry.
    pub loads: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL passed.
    pub expirations: u64,
    /// Number of entries currently indexed.
    pub entry_count: u64,
    /// Summed size of indexed entries in bytes.
    pub memory_bytes: u64,
    /// Entries removed from the index but still held by a reader.
    pub pending_disposal: u64,
    /// Entries whose memory has been released.
    pub disposed: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    ///
    /// Coalesced fetches count as hits: they did not run a loader.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.coalesced;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 70,
            coalesced: 10,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
