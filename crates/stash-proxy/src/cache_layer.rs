use crate::policy;
use axum::http::header::{ETAG, LAST_MODIFIED};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::Deserialize;
use stash_store::{CacheEntry, CacheStore, MemoryStore, ShardedStore, StoreStats};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Store backend selected in config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sharded,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => f.write_str("memory"),
            StoreKind::Sharded => f.write_str("sharded"),
        }
    }
}

/// Concrete store behind the layer.
enum StoreInner {
    Memory(MemoryStore),
    Sharded(ShardedStore),
}

impl StoreInner {
    fn as_store(&self) -> &dyn CacheStore {
        match self {
            StoreInner::Memory(s) => s as &dyn CacheStore,
            StoreInner::Sharded(s) => s as &dyn CacheStore,
        }
    }
}

/// What a Cache Update did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Stored { expires_at: SystemTime },
    /// `Cache-Control: no-store` or `private`; any previous entry was dropped.
    Refused,
}

/// Cache policy knobs plus the store they apply to.
///
/// The TTL and stale-serving switches are atomics so a config reload can
/// change them without rebuilding the store.
pub struct CacheLayer {
    store: StoreInner,
    default_ttl_secs: AtomicU64,
    serve_stale: AtomicBool,
}

impl CacheLayer {
    pub fn new(kind: StoreKind, default_ttl_secs: u64, serve_stale: bool) -> Self {
        let store = match kind {
            StoreKind::Memory => StoreInner::Memory(MemoryStore::new()),
            StoreKind::Sharded => StoreInner::Sharded(ShardedStore::new()),
        };

        tracing::info!(
            store = store.as_store().name(),
            default_ttl_secs,
            serve_stale,
            "cache layer initialized"
        );

        Self {
            store,
            default_ttl_secs: AtomicU64::new(default_ttl_secs),
            serve_stale: AtomicBool::new(serve_stale),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.store.as_store().get(key)
    }

    pub fn set(&self, key: String, entry: CacheEntry) {
        self.store.as_store().set(key, entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.store.as_store().delete(key)
    }

    pub fn clear(&self) -> usize {
        self.store.as_store().clear()
    }

    pub fn len(&self) -> usize {
        self.store.as_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.as_store().is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.store.as_store().name()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.as_store().stats()
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs.load(Ordering::Relaxed))
    }

    pub fn set_default_ttl(&self, secs: u64) {
        self.default_ttl_secs.store(secs, Ordering::Relaxed);
    }

    pub fn serve_stale(&self) -> bool {
        self.serve_stale.load(Ordering::Relaxed)
    }

    pub fn set_serve_stale(&self, serve_stale: bool) {
        self.serve_stale.store(serve_stale, Ordering::Relaxed);
    }

    /// Cache Update: store a fetched response under `key`, or refuse it.
    ///
    /// A refused response also removes whatever was cached under `key`, so a
    /// `no-store` answer never leaves an older copy behind.
    pub fn update(
        &self,
        key: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
    ) -> UpdateOutcome {
        if policy::forbids_storage(&policy::cache_control(headers)) {
            self.delete(key);
            metrics::counter!("stash_cache_refusals_total").increment(1);
            tracing::debug!(key = %key, "response forbids storage, not cached");
            return UpdateOutcome::Refused;
        }

        let entry = build_entry(status, headers, body, SystemTime::now(), self.default_ttl());
        let expires_at = entry.expires_at;
        self.set(key.to_string(), entry);

        metrics::counter!("stash_cache_writes_total").increment(1);
        tracing::debug!(
            key = %key,
            expires_at = ?expires_at,
            "cached"
        );
        UpdateOutcome::Stored { expires_at }
    }
}

/// Snapshot a buffered response as a [`CacheEntry`] received at `now`.
pub fn build_entry(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    now: SystemTime,
    default_ttl: Duration,
) -> CacheEntry {
    CacheEntry {
        status: status.as_u16(),
        headers: header_pairs(headers),
        body,
        cached_at: now,
        expires_at: policy::compute_expiry(headers, now, default_ttl),
        etag: header_string(headers, ETAG),
        last_modified: header_string(headers, LAST_MODIFIED),
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn header_string(headers: &HeaderMap, name: axum::http::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}
