//! In-memory response store for the stash caching proxy.
//!
//! Two interchangeable backends implement [`CacheStore`]:
//! [`MemoryStore`] (one map-wide read/write lock) and [`ShardedStore`]
//! (64 lock stripes). Neither evicts; entries live until deleted.

pub mod entry;
pub mod memory;
pub mod sharded;

pub use entry::{CacheEntry, CacheStore, StoreStats};
pub use memory::MemoryStore;
pub use sharded::ShardedStore;
