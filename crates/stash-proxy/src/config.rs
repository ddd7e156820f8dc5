use crate::cache_layer::{CacheLayer, StoreKind};
use crate::proxy::AppState;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Bound on one upstream exchange (send + body). 0 disables the bound.
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub store: StoreKind,
    /// Lifetime given to responses with neither `max-age` nor `Expires`.
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    /// Serve validator-less entries past their expiry instead of refetching.
    #[serde(default)]
    pub serve_stale: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Replace the port of `server.listen_addr`, keeping its host.
    pub fn override_port(&mut self, port: u16) {
        let mut addr: SocketAddr = self
            .server
            .listen_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));
        addr.set_port(port);
        self.server.listen_addr = addr.to_string();
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            default_ttl_seconds: default_ttl(),
            serve_stale: false,
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - TTL / serve_stale changed → atomic update (no cache data loss)
/// - Upstream timeout changed → atomic update
/// - Store backend changed → rebuild store (data cleared)
/// - Listen addresses changed → WARN log, ignore (restart required)
pub fn diff_and_apply(old: &Config, new: &Config, state: &AppState) {
    if old.server.listen_addr != new.server.listen_addr
        || old.server.admin_addr != new.server.admin_addr
    {
        tracing::warn!(
            old_listen = %old.server.listen_addr,
            new_listen = %new.server.listen_addr,
            old_admin = %old.server.admin_addr,
            new_admin = %new.server.admin_addr,
            "listen address change detected, ignoring. Restart to rebind"
        );
    }

    if old.upstream.timeout_ms != new.upstream.timeout_ms {
        state.set_upstream_timeout_ms(new.upstream.timeout_ms);
        tracing::info!(
            old = old.upstream.timeout_ms,
            new = new.upstream.timeout_ms,
            "config reloaded: upstream timeout changed"
        );
    }

    if old.cache.store != new.cache.store {
        let layer = CacheLayer::new(
            new.cache.store,
            new.cache.default_ttl_seconds,
            new.cache.serve_stale,
        );
        state.cache.store(Arc::new(layer));
        tracing::info!(
            old_store = %old.cache.store,
            new_store = %new.cache.store,
            "config reloaded: store backend changed. Cache cleared."
        );
        return;
    }

    let cache = state.cache.load();

    if old.cache.default_ttl_seconds != new.cache.default_ttl_seconds {
        cache.set_default_ttl(new.cache.default_ttl_seconds);
        tracing::info!(
            old = old.cache.default_ttl_seconds,
            new = new.cache.default_ttl_seconds,
            "config reloaded: default TTL changed"
        );
    }

    if old.cache.serve_stale != new.cache.serve_stale {
        cache.set_serve_stale(new.cache.serve_stale);
        tracing::info!(
            old = old.cache.serve_stale,
            new = new.cache.serve_stale,
            "config reloaded: serve_stale changed"
        );
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_ttl() -> u64 {
    3600
}
