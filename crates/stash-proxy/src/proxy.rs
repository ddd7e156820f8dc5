use crate::cache_layer::{CacheLayer, UpdateOutcome};
use crate::error::ProxyError;
use crate::policy;
use crate::revalidate::{self, Plan};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONNECTION, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use stash_store::CacheEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

/// Shared application state passed to all handlers.
///
/// Built once in `main`; every request task holds an `Arc` to it.
pub struct AppState {
    pub cache: ArcSwap<CacheLayer>,
    pub client: HttpClient,
    upstream_timeout_ms: AtomicU64,
}

impl AppState {
    pub fn new(cache: CacheLayer, client: HttpClient, upstream_timeout_ms: u64) -> Self {
        Self {
            cache: ArcSwap::from_pointee(cache),
            client,
            upstream_timeout_ms: AtomicU64::new(upstream_timeout_ms),
        }
    }

    /// `None` when no timeout is configured.
    pub fn upstream_timeout(&self) -> Option<Duration> {
        match self.upstream_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_upstream_timeout_ms(&self, ms: u64) {
        self.upstream_timeout_ms.store(ms, Ordering::Relaxed);
    }
}

/// How a response was produced. Sent to clients as `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache without contacting the origin.
    Hit,
    /// Origin answered 304 to a conditional request; served from cache.
    Revalidated,
    /// Fetched from the origin (fresh fetch or changed on revalidation).
    Miss,
    /// Request not eligible for caching; passed through.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Revalidated => "REVALIDATED",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Revalidated => "revalidated",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
        }
    }
}

/// Fully buffered upstream response.
struct Fetched {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Router that sends every request, whatever its path, through the proxy.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Main proxy handler. Checks cache, revalidates or forwards, caches response.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    match handle(&state, req).await {
        Ok((response, cache_status)) => {
            metrics::counter!("stash_requests_total", "outcome" => cache_status.metric_label())
                .increment(1);
            tracing::info!(
                method = %method,
                uri = %uri,
                status = response.status().as_u16(),
                cache = cache_status.as_str(),
                latency_us = start.elapsed().as_micros(),
                "completed"
            );
            response
        }
        Err(e) => {
            metrics::counter!("stash_requests_total", "outcome" => "error").increment(1);
            match &e {
                ProxyError::UnsupportedMethod(_) => {
                    tracing::info!(method = %method, uri = %uri, "rejected")
                }
                _ => tracing::error!(
                    method = %method,
                    uri = %uri,
                    error = %e,
                    latency_us = start.elapsed().as_micros(),
                    "proxy request failed"
                ),
            }
            e.into_response()
        }
    }
}

async fn handle(
    state: &AppState,
    req: Request<Body>,
) -> Result<(Response<Body>, CacheStatus), ProxyError> {
    if *req.method() == Method::CONNECT {
        return Err(ProxyError::UnsupportedMethod(Method::CONNECT));
    }

    tracing::debug!(method = %req.method(), uri = %req.uri(), "proxying request");

    let cache = state.cache.load_full();
    let cacheable = policy::is_cacheable(req.method(), req.headers());

    if !cacheable {
        let fetched = forward(state, req).await?;
        return Ok((fetched.into_response(CacheStatus::Bypass), CacheStatus::Bypass));
    }

    let key = policy::cache_key(req.method(), req.uri());

    match revalidate::plan(cache.get(&key), SystemTime::now(), cache.serve_stale()) {
        Plan::Serve(entry) => {
            tracing::debug!(key = %key, "cache HIT");
            Ok((cached_response(&entry, CacheStatus::Hit), CacheStatus::Hit))
        }
        Plan::Revalidate(entry) => revalidate_entry(state, &cache, &key, req, entry).await,
        Plan::Fetch => {
            let fetched = forward(state, req).await?;
            if fetched.status == StatusCode::OK {
                cache.update(&key, fetched.status, &fetched.headers, fetched.body.clone());
            }
            tracing::debug!(key = %key, status = fetched.status.as_u16(), "cache MISS → upstream");
            Ok((fetched.into_response(CacheStatus::Miss), CacheStatus::Miss))
        }
    }
}

/// Send a conditional request for `entry`; serve the cache on 304, else
/// replace the entry with whatever the origin returned.
async fn revalidate_entry(
    state: &AppState,
    cache: &CacheLayer,
    key: &str,
    req: Request<Body>,
    entry: Arc<CacheEntry>,
) -> Result<(Response<Body>, CacheStatus), ProxyError> {
    let (parts, _body) = req.into_parts();
    let headers = revalidate::conditional_headers(&parts.headers, &entry);
    let upstream_req = build_request(&parts.method, &parts.uri, &headers, Body::empty())?;

    let fetched = send(state, upstream_req).await?;

    if revalidate::is_not_modified(fetched.status) {
        tracing::debug!(key = %key, "origin confirmed cached copy");
        return Ok((
            cached_response(&entry, CacheStatus::Revalidated),
            CacheStatus::Revalidated,
        ));
    }

    match cache.update(key, fetched.status, &fetched.headers, fetched.body.clone()) {
        UpdateOutcome::Stored { expires_at } => tracing::debug!(
            key = %key,
            status = fetched.status.as_u16(),
            expires_at = ?expires_at,
            "origin returned a new representation"
        ),
        UpdateOutcome::Refused => tracing::debug!(
            key = %key,
            status = fetched.status.as_u16(),
            "origin returned a new representation, not storable"
        ),
    }
    Ok((fetched.into_response(CacheStatus::Miss), CacheStatus::Miss))
}

/// Forward the client's request unmodified.
async fn forward(state: &AppState, req: Request<Body>) -> Result<Fetched, ProxyError> {
    let (parts, body) = req.into_parts();
    let upstream_req = build_request(&parts.method, &parts.uri, &parts.headers, body)?;
    send(state, upstream_req).await
}

fn build_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Body,
) -> Result<Request<Body>, ProxyError> {
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ProxyError::RelativeTarget(uri.clone()));
    }

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(body)?)
}

/// One upstream exchange: send, then buffer the whole body.
async fn send(state: &AppState, req: Request<Body>) -> Result<Fetched, ProxyError> {
    let start = Instant::now();
    let exchange = async {
        let resp = state.client.request(req).await?;
        let (parts, body) = resp.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok::<_, ProxyError>(Fetched {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    };

    let result = match state.upstream_timeout() {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| ProxyError::Timeout(limit))?,
        None => exchange.await,
    };

    metrics::histogram!("stash_upstream_latency_seconds").record(start.elapsed().as_secs_f64());
    result
}

impl Fetched {
    fn into_response(self, cache_status: CacheStatus) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (key, value) in self.headers.iter() {
            if is_framing_header(key) {
                continue;
            }
            headers.append(key, value.clone());
        }
        headers.insert("x-cache", HeaderValue::from_static(cache_status.as_str()));
        response
    }
}

/// Build an HTTP response from a cached entry.
fn cached_response(cached: &CacheEntry, cache_status: CacheStatus) -> Response<Body> {
    let mut response = Response::new(Body::from(cached.body.clone()));
    *response.status_mut() = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    for (key, value) in &cached.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        if is_framing_header(&name) {
            continue;
        }
        headers.append(name, value);
    }
    headers.insert("x-cache", HeaderValue::from_static(cache_status.as_str()));
    response
}

/// Hop-by-hop headers the server re-derives for a buffered body.
fn is_framing_header(name: &HeaderName) -> bool {
    *name == TRANSFER_ENCODING || *name == CONNECTION
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    use crate::cache_layer::StoreKind;
    use hyper_util::rt::TokioExecutor;

    let client = Client::builder(TokioExecutor::new()).build_http();
    Arc::new(AppState::new(
        CacheLayer::new(StoreKind::Memory, 3600, false),
        client,
        0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MAX_FRESHNESS;
    use axum::http::header::{
        CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    };
    use axum::routing::{any, get};
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    const STAMP: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

    /// Requests seen by the test origin.
    #[derive(Default)]
    struct OriginLog {
        hits: AtomicUsize,
        if_none_match: Mutex<Vec<Option<String>>>,
        if_modified_since: Mutex<Vec<Option<String>>>,
        methods: Mutex<Vec<String>>,
    }

    async fn spawn_origin(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Origin whose `/etag` resource answers 304 when the client's
    /// `If-None-Match` matches the current version.
    async fn etag_origin(log: Arc<OriginLog>, version: Arc<Mutex<&'static str>>) -> SocketAddr {
        let app = Router::new().route(
            "/etag",
            get(move |headers: HeaderMap| {
                let log = Arc::clone(&log);
                let version = Arc::clone(&version);
                async move {
                    log.hits.fetch_add(1, Ordering::SeqCst);
                    let inm = headers
                        .get(IF_NONE_MATCH)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    log.if_none_match.lock().push(inm.clone());

                    let current = *version.lock();
                    let tag = format!("\"{current}\"");
                    if inm.as_deref() == Some(tag.as_str()) {
                        return (StatusCode::NOT_MODIFIED, [(ETAG, tag)], Body::empty())
                            .into_response();
                    }
                    (
                        StatusCode::OK,
                        [(ETAG, tag), (CACHE_CONTROL, "max-age=0".to_string())],
                        format!("body-{current}"),
                    )
                        .into_response()
                }
            }),
        );
        spawn_origin(app).await
    }

    /// Origin whose `/dated` resource only carries `Last-Modified` and
    /// answers 304 when `If-Modified-Since` repeats it.
    async fn last_modified_origin(log: Arc<OriginLog>) -> SocketAddr {
        let app = Router::new().route(
            "/dated",
            get(move |headers: HeaderMap| {
                let log = Arc::clone(&log);
                async move {
                    log.hits.fetch_add(1, Ordering::SeqCst);
                    let ims = headers
                        .get(IF_MODIFIED_SINCE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    log.if_modified_since.lock().push(ims.clone());

                    if ims.as_deref() == Some(STAMP) {
                        return (StatusCode::NOT_MODIFIED, Body::empty()).into_response();
                    }
                    (StatusCode::OK, [(LAST_MODIFIED, STAMP)], "dated-body").into_response()
                }
            }),
        );
        spawn_origin(app).await
    }

    /// Raw TCP origin that promises 100 body bytes, sends 10 and hangs up.
    async fn truncating_origin() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789")
                    .await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    /// Origin that echoes the method and counts calls for every path.
    async fn counting_origin(log: Arc<OriginLog>) -> SocketAddr {
        let app = Router::new()
            .route(
                "/plain",
                any(move |method: Method| {
                    let log = Arc::clone(&log);
                    async move {
                        log.hits.fetch_add(1, Ordering::SeqCst);
                        log.methods.lock().push(method.to_string());
                        (
                            [("x-multi", "one"), ("x-multi", "two")],
                            format!("plain-{method}"),
                        )
                    }
                }),
            )
            .route(
                "/private",
                get(|| async { ([(CACHE_CONTROL, "private")], "mine") }),
            )
            .route(
                "/no-store",
                get(|| async { ([(CACHE_CONTROL, "no-store")], "secret") }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope") }),
            );
        spawn_origin(app).await
    }

    async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = router(Arc::clone(state)).oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    fn get_req(url: &str) -> Request<Body> {
        Request::builder().uri(url).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn connect_is_rejected_before_cache_or_upstream() {
        let state = test_state();
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();

        let (status, _, _) = call(&state, req).await;

        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        let stats = state.cache.load().stats();
        assert_eq!(stats.hits + stats.misses + stats.sets, 0);
    }

    #[tokio::test]
    async fn miss_then_hit_without_validators() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(Arc::clone(&log)).await;
        let state = test_state();
        let url = format!("http://{addr}/plain");

        let (status, headers, body) = call(&state, get_req(&url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-cache").unwrap(), "MISS");
        assert_eq!(body, Bytes::from_static(b"plain-GET"));

        let (status, headers, body) = call(&state, get_req(&url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-cache").unwrap(), "HIT");
        assert_eq!(body, Bytes::from_static(b"plain-GET"));
        let multi: Vec<_> = headers.get_all("x-multi").iter().collect();
        assert_eq!(multi, ["one", "two"]);

        assert_eq!(log.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entry_without_validators_is_refetched() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(Arc::clone(&log)).await;
        let state = test_state();
        let url = format!("http://{addr}/plain");

        call(&state, get_req(&url)).await;
        let key = format!("GET:{url}");
        let mut entry = (*state.cache.load().get(&key).unwrap()).clone();
        entry.expires_at = SystemTime::now() - Duration::from_secs(1);
        state.cache.load().set(key.clone(), entry);

        let (_, headers, _) = call(&state, get_req(&url)).await;
        assert_eq!(headers.get("x-cache").unwrap(), "MISS");
        assert_eq!(log.hits.load(Ordering::SeqCst), 2);
        assert!(!state.cache.load().get(&key).unwrap().is_stale());
    }

    #[tokio::test]
    async fn serve_stale_keeps_serving_expired_entries() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(Arc::clone(&log)).await;
        let state = test_state();
        state.cache.load().set_serve_stale(true);
        let url = format!("http://{addr}/plain");

        call(&state, get_req(&url)).await;
        let key = format!("GET:{url}");
        let mut entry = (*state.cache.load().get(&key).unwrap()).clone();
        entry.expires_at = SystemTime::now() - Duration::from_secs(1);
        state.cache.load().set(key, entry);

        let (_, headers, _) = call(&state, get_req(&url)).await;
        assert_eq!(headers.get("x-cache").unwrap(), "HIT");
        assert_eq!(log.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conditional_request_served_from_cache_on_304() {
        let log = Arc::new(OriginLog::default());
        let version = Arc::new(Mutex::new("v1"));
        let addr = etag_origin(Arc::clone(&log), Arc::clone(&version)).await;
        let state = test_state();
        let url = format!("http://{addr}/etag");

        let (first_status, _, first_body) = call(&state, get_req(&url)).await;
        let key = format!("GET:{url}");
        let cached_at = state.cache.load().get(&key).unwrap().cached_at;

        let (status, headers, body) = call(&state, get_req(&url)).await;

        assert_eq!(status, first_status);
        assert_eq!(body, first_body);
        assert_eq!(body, Bytes::from_static(b"body-v1"));
        assert_eq!(headers.get("x-cache").unwrap(), "REVALIDATED");
        assert_eq!(
            *log.if_none_match.lock(),
            vec![None, Some("\"v1\"".to_string())]
        );
        // 304 leaves the entry untouched.
        assert_eq!(state.cache.load().get(&key).unwrap().cached_at, cached_at);
    }

    #[tokio::test]
    async fn last_modified_revalidation_served_from_cache_on_304() {
        let log = Arc::new(OriginLog::default());
        let addr = last_modified_origin(Arc::clone(&log)).await;
        let state = test_state();
        let url = format!("http://{addr}/dated");

        let (first_status, _, first_body) = call(&state, get_req(&url)).await;
        let key = format!("GET:{url}");
        let entry = state.cache.load().get(&key).unwrap();
        assert!(entry.etag.is_empty());
        assert_eq!(entry.last_modified, STAMP);

        let (status, headers, body) = call(&state, get_req(&url)).await;

        assert_eq!(status, first_status);
        assert_eq!(body, first_body);
        assert_eq!(body, Bytes::from_static(b"dated-body"));
        assert_eq!(headers.get("x-cache").unwrap(), "REVALIDATED");
        assert_eq!(headers.get(LAST_MODIFIED).unwrap(), STAMP);
        assert_eq!(
            *log.if_modified_since.lock(),
            vec![None, Some(STAMP.to_string())]
        );
        assert_eq!(log.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn changed_resource_replaces_entry() {
        let log = Arc::new(OriginLog::default());
        let version = Arc::new(Mutex::new("v1"));
        let addr = etag_origin(Arc::clone(&log), Arc::clone(&version)).await;
        let state = test_state();
        let url = format!("http://{addr}/etag");

        call(&state, get_req(&url)).await;
        *version.lock() = "v2";

        let (status, headers, body) = call(&state, get_req(&url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-cache").unwrap(), "MISS");
        assert_eq!(body, Bytes::from_static(b"body-v2"));

        let entry = state.cache.load().get(&format!("GET:{url}")).unwrap();
        assert_eq!(entry.etag, "\"v2\"");
        assert_eq!(entry.body, Bytes::from_static(b"body-v2"));
    }

    #[tokio::test]
    async fn private_and_no_store_are_not_cached() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(log).await;
        let state = test_state();

        for path in ["private", "no-store"] {
            let url = format!("http://{addr}/{path}");
            let (status, _, _) = call(&state, get_req(&url)).await;
            assert_eq!(status, StatusCode::OK);
            assert!(state.cache.load().get(&format!("GET:{url}")).is_none());
        }
    }

    #[tokio::test]
    async fn only_200_is_cached_on_fresh_fetch() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(log).await;
        let state = test_state();
        let url = format!("http://{addr}/missing");

        let (status, headers, _) = call(&state, get_req(&url)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get("x-cache").unwrap(), "MISS");
        assert!(state.cache.load().is_empty());
    }

    #[tokio::test]
    async fn non_get_and_request_no_store_bypass_cache() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(Arc::clone(&log)).await;
        let state = test_state();
        let url = format!("http://{addr}/plain");

        let post = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .body(Body::from("payload"))
            .unwrap();
        let (status, headers, body) = call(&state, post).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-cache").unwrap(), "BYPASS");
        assert_eq!(body, Bytes::from_static(b"plain-POST"));

        let no_store = Request::builder()
            .uri(&url)
            .header(CACHE_CONTROL, "no-store")
            .body(Body::empty())
            .unwrap();
        let (_, headers, _) = call(&state, no_store).await;
        assert_eq!(headers.get("x-cache").unwrap(), "BYPASS");

        assert!(state.cache.load().is_empty());
        assert_eq!(*log.methods.lock(), ["POST", "GET"]);
    }

    #[tokio::test]
    async fn concurrent_misses_leave_one_entry() {
        let log = Arc::new(OriginLog::default());
        let addr = counting_origin(Arc::clone(&log)).await;
        let state = test_state();
        let url = format!("http://{addr}/plain");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let url = url.clone();
                tokio::spawn(async move { call(&state, get_req(&url)).await })
            })
            .collect();

        for task in tasks {
            let (status, _, body) = task.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, Bytes::from_static(b"plain-GET"));
        }

        let cache = state.cache.load();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&format!("GET:{url}")).is_some());
    }

    #[tokio::test]
    async fn unreachable_origin_is_500_and_not_cached() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = test_state();
        let (status, _, body) = call(&state, get_req(&format!("http://{addr}/x"))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.is_empty());
        assert!(state.cache.load().is_empty());
    }

    #[tokio::test]
    async fn relative_target_is_500() {
        let state = test_state();
        let (status, _, body) = call(&state, get_req("/just-a-path")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8_lossy(&body).contains("absolute"));
    }

    #[tokio::test]
    async fn upstream_timeout_is_500() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = spawn_origin(app).await;
        let state = test_state();
        state.set_upstream_timeout_ms(50);

        let (status, _, body) = call(&state, get_req(&format!("http://{addr}/slow"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8_lossy(&body).contains("did not answer"));
        assert!(state.cache.load().is_empty());
    }

    #[tokio::test]
    async fn truncated_upstream_body_is_500_and_not_cached() {
        let addr = truncating_origin().await;
        let state = test_state();

        let (status, headers, body) =
            call(&state, get_req(&format!("http://{addr}/short"))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(headers.get("x-cache").is_none());
        assert!(!body.starts_with(b"0123456789"));
        assert!(state.cache.load().is_empty());
    }

    #[tokio::test]
    async fn huge_max_age_is_cached_with_capped_lifetime() {
        // Debug level so the `expires_at` log fields are evaluated.
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = Router::new().route(
            "/forever",
            get(|| async {
                (
                    [
                        (CACHE_CONTROL, "max-age=18446744073709551615"),
                        (ETAG, "\"forever\""),
                    ],
                    "forever",
                )
            }),
        );
        let addr = spawn_origin(app).await;
        let state = test_state();
        let url = format!("http://{addr}/forever");
        let key = format!("GET:{url}");

        let (status, headers, body) = call(&state, get_req(&url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-cache").unwrap(), "MISS");
        assert_eq!(body, Bytes::from_static(b"forever"));

        let entry = state.cache.load().get(&key).unwrap();
        assert_eq!(entry.expires_at, entry.cached_at + MAX_FRESHNESS);
        assert!(!entry.is_stale());

        // The origin never answers 304, so revalidation stores it again.
        let (status, _, body) = call(&state, get_req(&url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"forever"));
        let entry = state.cache.load().get(&key).unwrap();
        assert_eq!(entry.expires_at, entry.cached_at + MAX_FRESHNESS);
    }

    #[tokio::test]
    async fn works_as_forward_proxy_for_http_clients() {
        let log = Arc::new(OriginLog::default());
        let origin = counting_origin(Arc::clone(&log)).await;
        let proxy = spawn_origin(router(test_state())).await;

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
            .build()
            .unwrap();
        let url = format!("http://{origin}/plain");

        let first = client.get(&url).send().await.unwrap();
        assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
        assert_eq!(first.text().await.unwrap(), "plain-GET");

        let second = client.get(&url).send().await.unwrap();
        assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
        assert_eq!(second.text().await.unwrap(), "plain-GET");

        assert_eq!(log.hits.load(Ordering::SeqCst), 1);
    }
}
