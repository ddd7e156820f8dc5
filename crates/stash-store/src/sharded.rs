use crate::entry::{CacheEntry, CacheStore, StoreStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

type Shard = RwLock<HashMap<String, Arc<CacheEntry>>>;

/// Lock-striped variant of [`MemoryStore`](crate::MemoryStore).
///
/// Keys are spread across 64 independent maps, each behind its own `RwLock`,
/// so a write only excludes readers of the same shard. Observable behaviour
/// is identical to the single-lock store: unbounded, last write wins, `get`
/// ignores expiry.
///
/// Shard selection uses `ahash` with fixed seeds so a key always lands on the
/// same shard.
pub struct ShardedStore {
    shards: Box<[Shard]>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl ShardedStore {
    pub fn new() -> Self {
        let shards: Vec<Shard> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(key: &str) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[Self::shard_index(key)]
    }
}

impl Default for ShardedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for ShardedStore {
    fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let found = self.shard(key).read().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn set(&self, key: String, entry: CacheEntry) {
        self.shard(&key).write().insert(key, Arc::new(entry));
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    fn delete(&self, key: &str) -> bool {
        let removed = self.shard(key).write().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn clear(&self) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            removed += shard.len();
            shard.clear();
        }
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Total number of entries across all shards.
    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    fn name(&self) -> &'static str {
        "sharded"
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
