use http::header::{
    HeaderName, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    ACCESS_CONTROL_MAX_AGE, AGE, ALT_SVC, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, SET_COOKIE,
    TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderValue};
use std::time::Duration;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Headers bound to a single connection. Never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &["keep-alive", "proxy-connection", "proxy-authenticate", "proxy-authorization"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn header_value(self) -> HeaderValue {
        match self {
            CacheStatus::Hit => HeaderValue::from_static("HIT"),
            CacheStatus::Miss => HeaderValue::from_static("MISS"),
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == CONNECTION
        || name == TE
        || name == TRAILER
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || HOP_BY_HOP.contains(&name.as_str())
}

fn is_access_control(name: &HeaderName) -> bool {
    name == ACCESS_CONTROL_ALLOW_ORIGIN
        || name == ACCESS_CONTROL_ALLOW_METHODS
        || name == ACCESS_CONTROL_ALLOW_HEADERS
        || name == ACCESS_CONTROL_ALLOW_CREDENTIALS
        || name == ACCESS_CONTROL_EXPOSE_HEADERS
        || name == ACCESS_CONTROL_MAX_AGE
}

/// Build the header set shared by the client response and the cached copy.
///
/// Connection-scoped headers, `alt-svc` (it advertises the upstream's own
/// endpoints), `content-length` (recomputed from the buffered body), the
/// upstream's CORS headers and its freshness headers are dropped; a short
/// `Cache-Control`/`Age` pair is set instead. Any header named by the
/// upstream's `Connection` header is dropped as well.
pub fn rewrite_upstream(upstream: &HeaderMap, client_max_age: Duration) -> HeaderMap {
    let connection_listed: Vec<String> = upstream
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(upstream.len() + 2);
    for (name, value) in upstream {
        if is_hop_by_hop(name)
            || is_access_control(name)
            || name == ALT_SVC
            || name == CONTENT_LENGTH
            || name == CACHE_CONTROL
            || name == AGE
            || connection_listed.iter().any(|t| t == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    out.insert(CACHE_CONTROL, cache_control_value(client_max_age));
    out.insert(AGE, HeaderValue::from(0u64));
    out
}

/// The stored copy of a rewritten header set: identical minus `set-cookie`,
/// which belongs to the one client the upstream answered.
pub fn for_storage(rewritten: &HeaderMap) -> HeaderMap {
    let mut stored = rewritten.clone();
    stored.remove(SET_COOKIE);
    stored
}

/// Drop request headers that must not reach the upstream: connection-scoped
/// ones, the client's `Host`, and `Accept-Encoding` so stored bodies are
/// never compressed for one client and replayed to another.
pub fn sanitize_forwarded(headers: &mut HeaderMap) {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in connection_listed {
        headers.remove(name);
    }

    let drop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in drop {
        headers.remove(name);
    }

    headers.remove(http::header::HOST);
    headers.remove(http::header::ACCEPT_ENCODING);
}

/// Set the freshness headers for a response replayed from the cache.
pub fn refresh_age(headers: &mut HeaderMap, age: Duration, client_max_age: Duration) {
    let age = age.min(client_max_age).as_secs();
    headers.insert(AGE, HeaderValue::from(age));
}

fn cache_control_value(max_age: Duration) -> HeaderValue {
    // Formatted from an integer, always a valid header value.
    HeaderValue::from_str(&format!("public, max-age={}", max_age.as_secs()))
        .unwrap_or_else(|_| HeaderValue::from_static("public"))
}

/// Whether the upstream allows a shared cache to keep this response.
pub fn upstream_allows_caching(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .all(|v| parse_cache_control(v).cacheable)
}

/// Parse Cache-Control header to determine cacheability.
pub fn parse_cache_control(value: &str) -> CacheControl {
    let mut result = CacheControl { cacheable: true };

    for directive in value.split(',').map(|s| s.trim().to_lowercase()) {
        if directive == "no-store" || directive == "private" || directive.starts_with("private=") {
            result.cacheable = false;
        }
    }

    result
}

pub struct CacheControl {
    pub cacheable: bool,
}
