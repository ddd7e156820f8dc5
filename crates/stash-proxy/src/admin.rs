use crate::proxy::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// State for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub store: String,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub hit_rate: f64,
    pub default_ttl_seconds: u64,
    pub serve_stale: bool,
}

impl StoreSnapshot {
    fn from_state(state: &AppState) -> Self {
        let cache = state.cache.load();
        let stats = cache.stats();
        let lookups = stats.hits + stats.misses;
        StoreSnapshot {
            store: cache.name().to_string(),
            size: stats.current_size,
            hits: stats.hits,
            misses: stats.misses,
            sets: stats.sets,
            deletes: stats.deletes,
            hit_rate: if lookups > 0 {
                stats.hits as f64 / lookups as f64
            } else {
                0.0
            },
            default_ttl_seconds: cache.default_ttl().as_secs(),
            serve_stale: cache.serve_stale(),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/cache", delete(invalidate_handler))
        .route("/api/cache/all", delete(clear_handler))
        .with_state(state)
}

/// GET /metrics: Prometheus text exposition.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// GET /api/stats: one-shot store stats.
async fn stats_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(StoreSnapshot::from_state(&state.app))
}

#[derive(Deserialize)]
pub struct InvalidateParams {
    pub key: String,
}

/// DELETE /api/cache?key=GET:http://...: drop one entry.
async fn invalidate_handler(
    State(state): State<AdminState>,
    Query(params): Query<InvalidateParams>,
) -> impl IntoResponse {
    if state.app.cache.load().delete(&params.key) {
        tracing::info!(key = %params.key, "cache entry invalidated");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// DELETE /api/cache/all: drop every entry.
async fn clear_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let removed = state.app.cache.load().clear();
    tracing::info!(removed, "cache cleared");
    Json(serde_json::json!({ "removed": removed }))
}
