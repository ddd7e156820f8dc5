use crate::entry::{CacheEntry, CacheStore, StoreStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unbounded store guarded by a single map-wide `RwLock`.
///
/// - `get`: shared read lock, so lookups run in parallel.
/// - `set` / `delete` / `clear`: exclusive write lock on the whole map.
///
/// Counters are atomics so that a hit can be recorded without upgrading the
/// read lock.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let found = self.entries.read().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn set(&self, key: String, entry: CacheEntry) {
        self.entries.write().insert(key, Arc::new(entry));
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    fn delete(&self, key: &str) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let n = entries.len();
        entries.clear();
        self.deletes.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            current_size: self.len(),
        }
    }
}
