use bytes::Bytes;
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of an upstream response held by a store.
///
/// Entries are immutable once stored. Readers get an `Arc` to the stored
/// snapshot; a later `set` swaps the `Arc` rather than touching the old one.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub status: u16,
    /// Response headers in arrival order, repeated names kept as separate pairs.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cached_at: SystemTime,
    pub expires_at: SystemTime,
    /// `ETag` value, empty when the origin sent none.
    pub etag: String,
    /// `Last-Modified` value, empty when the origin sent none.
    pub last_modified: String,
}

impl CacheEntry {
    /// Whether the entry carries a validator usable in a conditional request.
    pub fn has_validators(&self) -> bool {
        !self.etag.is_empty() || !self.last_modified.is_empty()
    }

    pub fn is_stale_at(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(SystemTime::now())
    }
}

/// Snapshot of store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub current_size: usize,
}

/// Common interface for the response store backends.
///
/// `get` never filters on `expires_at`: staleness is the caller's decision.
/// Every method takes `&self`; implementations do their own locking so
/// callers can share one store across tasks without extra synchronisation.
pub trait CacheStore: Send + Sync {
    /// Look up a key. Returns the entry if present, stale or not.
    fn get(&self, key: &str) -> Option<Arc<CacheEntry>>;

    /// Insert or overwrite a key unconditionally.
    fn set(&self, key: String, entry: CacheEntry);

    /// Remove a key. Returns whether an entry was removed.
    fn delete(&self, key: &str) -> bool;

    /// Drop every entry. Returns how many were removed.
    fn clear(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    fn stats(&self) -> StoreStats;
}
