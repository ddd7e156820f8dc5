//! Cacheability, cache keys and freshness lifetime.
//!
//! Everything here is pure: no I/O, no clock reads. Callers pass `now`.

use axum::http::header::{CACHE_CONTROL, EXPIRES};
use axum::http::{HeaderMap, Method, Uri};
use std::time::{Duration, SystemTime};

/// Whether a request may be answered from, or stored into, the cache.
///
/// Only `GET` qualifies, and only when the request itself does not carry
/// `Cache-Control: no-store`.
pub fn is_cacheable(method: &Method, headers: &HeaderMap) -> bool {
    if *method != Method::GET {
        return false;
    }
    !has_directive(&cache_control(headers), "no-store")
}

/// `"{method}:{url}"`, the only identity used for lookups.
pub fn cache_key(method: &Method, uri: &Uri) -> String {
    format!("{}:{}", method, uri)
}

/// Largest freshness lifetime ever applied, 2^31 seconds (RFC 9111 §1.2.2).
pub const MAX_FRESHNESS: Duration = Duration::from_secs(1 << 31);

/// First `max-age=<seconds>` directive of a `Cache-Control` value.
///
/// Absent directive, empty header and unparsable seconds all give `None`.
/// Negative values are not delta-seconds, so `max-age=-5` is treated as
/// absent rather than as an already expired lifetime. Values above
/// [`MAX_FRESHNESS`] are clamped to it.
pub fn parse_max_age(value: &str) -> Option<Duration> {
    for directive in value.split(',').map(str::trim) {
        if let Some(age) = directive.strip_prefix("max-age=") {
            return age
                .parse::<u64>()
                .ok()
                .map(|secs| Duration::from_secs(secs).min(MAX_FRESHNESS));
        }
    }
    None
}

/// Response `Cache-Control` forbids a shared cache from storing it.
pub fn forbids_storage(cache_control: &str) -> bool {
    has_directive(cache_control, "no-store") || has_directive(cache_control, "private")
}

/// All `Cache-Control` values of a header map joined into one list.
pub fn cache_control(headers: &HeaderMap) -> String {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Expiry instant for a response received at `now`.
///
/// Priority: `max-age`, then a parsable `Expires`, then `now + default_ttl`.
/// Lifetimes are capped at [`MAX_FRESHNESS`]; a sum the clock cannot
/// represent falls through to the next rule, and finally to `now`.
pub fn compute_expiry(headers: &HeaderMap, now: SystemTime, default_ttl: Duration) -> SystemTime {
    if let Some(at) =
        parse_max_age(&cache_control(headers)).and_then(|age| expire_after(now, age))
    {
        return at;
    }

    if let Some(expires) = headers
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
    {
        return expires;
    }

    expire_after(now, default_ttl).unwrap_or(now)
}

fn expire_after(now: SystemTime, lifetime: Duration) -> Option<SystemTime> {
    now.checked_add(lifetime.min(MAX_FRESHNESS))
}

/// Directive name match, ignoring case and any `=argument` suffix.
fn has_directive(cache_control: &str, name: &str) -> bool {
    cache_control.split(',').any(|directive| {
        let directive = directive.trim();
        let directive_name = directive.split('=').next().unwrap_or(directive).trim();
        directive_name.eq_ignore_ascii_case(name)
    })
}
