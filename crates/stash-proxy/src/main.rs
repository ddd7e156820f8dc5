mod admin;
mod cache_layer;
mod config;
mod error;
mod policy;
mod proxy;
mod revalidate;

use admin::AdminState;
use cache_layer::CacheLayer;
use clap::Parser;
use config::Config;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::AppState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Caching HTTP forward proxy with ETag / Last-Modified revalidation.
#[derive(Parser)]
#[command(name = "stash-proxy")]
struct Args {
    /// Port to run the proxy on (overrides the port of server.listen_addr)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the TOML config file
    #[arg(long, default_value = "stash.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();

    let mut config = load_config(&args.config);
    if let Some(port) = args.port {
        config.override_port(port);
    }

    // Install Prometheus metrics recorder
    let prometheus = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install prometheus recorder, /metrics disabled");
            None
        }
    };

    let cache = CacheLayer::new(
        config.cache.store,
        config.cache.default_ttl_seconds,
        config.cache.serve_stale,
    );

    // Build HTTP client for upstream requests
    let client = Client::builder(TokioExecutor::new()).build_http();

    let state = Arc::new(AppState::new(cache, client, config.upstream.timeout_ms));

    let shutdown = CancellationToken::new();

    let proxy_router = proxy::router(Arc::clone(&state))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    let admin_router = admin::router(AdminState {
        app: Arc::clone(&state),
        prometheus,
    })
    .layer(TraceLayer::new_for_http());

    let proxy_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        admin = %admin_addr,
        store = %config.cache.store,
        default_ttl_secs = config.cache.default_ttl_seconds,
        serve_stale = config.cache.serve_stale,
        upstream_timeout_ms = config.upstream.timeout_ms,
        "stash proxy starting"
    );

    let proxy_listener = match tokio::net::TcpListener::bind(&proxy_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %proxy_addr, "failed to bind proxy");
            std::process::exit(1);
        }
    };
    let admin_listener = match tokio::net::TcpListener::bind(&admin_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %admin_addr, "failed to bind admin");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "configure your HTTP client to use http://{} as its proxy",
        proxy_addr
    );

    spawn_config_watcher(args.config, config, Arc::clone(&state));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let admin_future = axum::serve(admin_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    tracing::info!("stash proxy shut down");
}

/// Load the config file, falling back to defaults when absent or invalid.
fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        return Config::default();
    }

    match Config::load(path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            c
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to load config, using defaults");
            Config::default()
        }
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Spawn a filesystem watcher on the config file that applies safe changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        config::diff_and_apply(&old, &new_config, &state);
                        *old = new_config;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::debug!(error = %e, path = %config_path.display(), "config file not watched");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!(path = %config_path.display(), "config file watcher started");
}
