//! Local persistent cache of fetched query results.
//!
//! The cache maps a string key to `{ data, timestamp }` and survives process
//! restarts (see [`SqliteCache`]). It is never authoritative: the data
//! service is the source of truth, and every failure here degrades to a
//! cache miss.
//!
//! # Module layout
//!
//! - [`PersistentCache`] - raw string storage trait (this module).
//! - [`read_entry`] / [`write_entry`] - typed JSON helpers that log and
//!   swallow serialization or storage failures (this module).
//! - [`sqlite`] - durable rusqlite-backed store.
//! - [`memory`] - `HashMap` store for tests and ephemeral sessions.

pub mod memory;
pub mod sqlite;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// A cached value and the epoch-millis time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: i64,
}

impl<T> CacheEntry<T> {
    pub const fn new(data: T, timestamp: i64) -> Self {
        Self { data, timestamp }
    }

    /// Age of the entry relative to `now_millis`; never negative.
    #[must_use]
    pub const fn age_millis(&self, now_millis: i64) -> i64 {
        let age = now_millis - self.timestamp;
        if age < 0 { 0 } else { age }
    }

    /// Whether the entry is older than `window_millis`.
    ///
    /// An entry exactly at the window edge is still fresh.
    #[must_use]
    pub const fn is_stale(&self, now_millis: i64, window_millis: i64) -> bool {
        self.age_millis(now_millis) > window_millis
    }
}

/// Serialized form handed to storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub data: String,
    pub timestamp: i64,
}

/// Synchronous key-value storage for cache entries.
pub trait PersistentCache: Send + Sync + std::fmt::Debug {
    fn get_raw(&self, key: &str) -> Result<Option<RawEntry>, SyncError>;

    fn set_raw(&self, key: &str, entry: RawEntry) -> Result<(), SyncError>;

    /// Remove `key`; returns whether anything was removed.
    fn evict(&self, key: &str) -> Result<bool, SyncError>;

    fn keys(&self) -> Result<Vec<String>, SyncError>;
}

/// Read and decode the entry for `key`.
///
/// Missing, unreadable, or undecodable entries all come back as `None`.
pub fn read_entry<T: DeserializeOwned>(
    cache: &dyn PersistentCache,
    key: &str,
) -> Option<CacheEntry<T>> {
    let raw = match cache.get_raw(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(cache_key = key, "cache read failed, treating as miss: {e}");
            return None;
        }
    };

    match serde_json::from_str::<T>(&raw.data) {
        Ok(data) => Some(CacheEntry::new(data, raw.timestamp)),
        Err(e) => {
            tracing::warn!(cache_key = key, "cache entry undecodable, treating as miss: {e}");
            None
        }
    }
}

/// Encode and store `entry` under `key`.
///
/// Returns `false` (after logging) when encoding or storage fails.
pub fn write_entry<T: Serialize>(
    cache: &dyn PersistentCache,
    key: &str,
    entry: &CacheEntry<T>,
) -> bool {
    let data = match serde_json::to_string(&entry.data) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(cache_key = key, "cache entry not serializable, skipping write: {e}");
            return false;
        }
    };

    match cache.set_raw(
        key,
        RawEntry {
            data,
            timestamp: entry.timestamp,
        },
    ) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(cache_key = key, "cache write failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheEntry, MemoryCache, PersistentCache, RawEntry, read_entry, write_entry};
    use serde::{Serialize, Serializer};

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refuses to serialize"))
        }
    }

    #[test]
    fn staleness_edge_is_fresh() {
        let entry = CacheEntry::new((), 1_000);
        assert!(!entry.is_stale(1_500, 500));
        assert!(entry.is_stale(1_501, 500));
        // Clock skew backwards never counts as stale.
        assert_eq!(entry.age_millis(0), 0);
    }

    #[test]
    fn typed_roundtrip_through_raw_store() {
        let cache = MemoryCache::new();
        assert!(write_entry(&cache, "tasks:a", &CacheEntry::new(vec![1, 2, 3], 42)));

        let entry: CacheEntry<Vec<i32>> = read_entry(&cache, "tasks:a").expect("cache hit");
        assert_eq!(entry.data, vec![1, 2, 3]);
        assert_eq!(entry.timestamp, 42);
    }

    #[test]
    fn serialization_failure_is_swallowed() {
        let cache = MemoryCache::new();
        assert!(!write_entry(&cache, "bad", &CacheEntry::new(Unserializable, 1)));
        assert!(cache.get_raw("bad").expect("get").is_none());
    }

    #[test]
    fn undecodable_entry_reads_as_miss() {
        let cache = MemoryCache::new();
        cache
            .set_raw(
                "tasks:a",
                RawEntry {
                    data: "{not json".into(),
                    timestamp: 1,
                },
            )
            .expect("set raw");
        assert!(read_entry::<Vec<i32>>(&cache, "tasks:a").is_none());

        // Shape mismatch is also a miss.
        assert!(write_entry(&cache, "tasks:b", &CacheEntry::new("text", 1)));
        assert!(read_entry::<Vec<i32>>(&cache, "tasks:b").is_none());
    }
}
