use axum::extract::Path;
use axum::http::header::{CACHE_CONTROL, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

/// `ETag` derived from the id, with `max-age=0` so every proxy hit revalidates.
async fn etag(Path(id): Path<u64>, headers: HeaderMap) -> Response {
    let tag = format!("\"item-{id}\"");
    let matches = headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == tag);

    if matches {
        tracing::info!(id, "etag matched, 304");
        return (StatusCode::NOT_MODIFIED, [(ETAG, tag)]).into_response();
    }

    tracing::info!(id, "etag miss, full body");
    (
        [(ETAG, tag), (CACHE_CONTROL, "max-age=0".to_string())],
        Json(json!({ "id": id, "name": format!("Item {}", id) })),
    )
        .into_response()
}

/// Fixed `Last-Modified`; honours `If-Modified-Since` by exact match.
async fn last_modified(headers: HeaderMap) -> Response {
    let stamp = "Wed, 21 Oct 2015 07:28:00 GMT";
    let unchanged = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == stamp);

    if unchanged {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    ([(LAST_MODIFIED, stamp)], "unchanged since 2015").into_response()
}

async fn max_age(Path(secs): Path<u64>) -> Response {
    (
        [(CACHE_CONTROL, format!("max-age={secs}"))],
        format!("fresh for {secs}s, generated at {}", httpdate::fmt_http_date(SystemTime::now())),
    )
        .into_response()
}

async fn expires() -> Response {
    let at = SystemTime::now() + Duration::from_secs(30);
    (
        [(EXPIRES, httpdate::fmt_http_date(at))],
        "expires in 30s",
    )
        .into_response()
}

async fn private() -> Response {
    ([(CACHE_CONTROL, "private")], "per-user content").into_response()
}

async fn no_store() -> Response {
    ([(CACHE_CONTROL, "no-store")], "never cache me").into_response()
}

async fn plain() -> String {
    format!("generated at {}", httpdate::fmt_http_date(SystemTime::now()))
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/etag/{id}", get(etag))
        .route("/last-modified", get(last_modified))
        .route("/max-age/{secs}", get(max_age))
        .route("/expires", get(expires))
        .route("/private", get(private))
        .route("/no-store", get(no_store))
        .route("/plain", get(plain))
        .route("/health", get(health));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo origin starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr, "failed to bind");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "demo origin stopped");
    }
}
