//! Decides what to do with a store lookup, and builds conditional requests.

use axum::http::header::{CONTENT_LENGTH, IF_MODIFIED_SINCE, IF_NONE_MATCH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use stash_store::CacheEntry;
use std::sync::Arc;
use std::time::SystemTime;

/// Next step for a cacheable request after the store lookup.
#[derive(Debug)]
pub enum Plan {
    /// Answer from the entry without contacting the origin.
    Serve(Arc<CacheEntry>),
    /// Ask the origin whether the entry is still current.
    Revalidate(Arc<CacheEntry>),
    /// Nothing usable cached; do a plain upstream fetch.
    Fetch,
}

/// Pick a [`Plan`] for a lookup result.
///
/// Entries with validators are always revalidated. A validator-less entry
/// is served while fresh; once past `expires_at` it is refetched unless
/// `serve_stale` is set.
pub fn plan(lookup: Option<Arc<CacheEntry>>, now: SystemTime, serve_stale: bool) -> Plan {
    let Some(entry) = lookup else {
        return Plan::Fetch;
    };

    if entry.has_validators() {
        return Plan::Revalidate(entry);
    }

    if serve_stale || !entry.is_stale_at(now) {
        Plan::Serve(entry)
    } else {
        Plan::Fetch
    }
}

/// Headers for a body-less conditional request.
///
/// Starts from the client's headers and sets `If-None-Match` /
/// `If-Modified-Since` from the entry's validators, replacing any the client
/// sent. Body framing headers are dropped since no body is sent.
pub fn conditional_headers(original: &HeaderMap, entry: &CacheEntry) -> HeaderMap {
    let mut headers = original.clone();
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);

    if !entry.etag.is_empty() {
        match HeaderValue::from_str(&entry.etag) {
            Ok(v) => {
                headers.insert(IF_NONE_MATCH, v);
            }
            Err(_) => tracing::warn!(etag = %entry.etag, "cached ETag is not a valid header value"),
        }
    }

    if !entry.last_modified.is_empty() {
        match HeaderValue::from_str(&entry.last_modified) {
            Ok(v) => {
                headers.insert(IF_MODIFIED_SINCE, v);
            }
            Err(_) => tracing::warn!(
                last_modified = %entry.last_modified,
                "cached Last-Modified is not a valid header value"
            ),
        }
    }

    headers
}

/// The origin confirmed the cached copy is still current.
pub fn is_not_modified(status: StatusCode) -> bool {
    status == StatusCode::NOT_MODIFIED
}
