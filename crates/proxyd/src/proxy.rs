use crate::capture::{capture, CaptureSettings};
use crate::cors::{AccessControlPolicy, CorsHeaders};
use crate::headers::{self, CacheStatus, X_CACHE};
use crate::upstream::{ForwardError, HttpClient, Upstream};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, Response, StatusCode};
use axum::routing::any;
use axum::Router;
use http::header::ORIGIN;
use proxyd_cache::{CacheKey, CachedEntry, ResponseCache};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub cache: Arc<dyn ResponseCache>,
    pub client: HttpClient,
    pub upstream: Upstream,
    pub cors: ArcSwap<AccessControlPolicy>,
    pub capture: CaptureSettings,
    pub path_prefix: Option<String>,
}

impl AppState {
    /// Whether `path` falls under the configured prefix. Matching is by
    /// whole segments: `/api` admits `/api` and `/api/x` but not `/apix`.
    pub fn admits(&self, path: &str) -> bool {
        let Some(prefix) = self.path_prefix.as_deref() else {
            return true;
        };
        let prefix = prefix.trim_end_matches('/');
        prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Proxy router: every path and method goes through [`proxy_handler`].
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Main proxy handler. Serves GETs from the cache when it can, otherwise
/// forwards upstream and captures the response on the way back.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();

    if !state.admits(req.uri().path()) {
        tracing::debug!(path = %req.uri().path(), "outside path prefix, rejecting");
        return plain(StatusCode::NOT_FOUND, "Not Found");
    }

    // Computed per request, never taken from a stored entry.
    let cors = state.cors.load().evaluate(req.headers().get(ORIGIN));

    if req.method() == Method::OPTIONS {
        let mut response = plain(StatusCode::NO_CONTENT, "");
        cors.apply(response.headers_mut());
        return response;
    }

    let cacheable = req.method() == Method::GET;
    let key = CacheKey::from_uri(req.uri());

    if cacheable {
        if let Some(entry) = state.cache.get(&key) {
            metrics::counter!("proxyd_cache_hits_total").increment(1);
            tracing::debug!(
                key = %key,
                latency_us = start.elapsed().as_micros() as u64,
                "cache HIT"
            );
            return hit_response(&entry, &cors, state.capture.client_max_age);
        }
        metrics::counter!("proxyd_cache_misses_total").increment(1);
    }

    let upstream_resp = match state.upstream.forward(&state.client, req).await {
        Ok(resp) => resp,
        Err(e) => {
            metrics::counter!("proxyd_upstream_errors_total", "kind" => e.kind()).increment(1);
            tracing::error!(
                error = %e,
                key = %key,
                upstream = %state.upstream.authority(),
                "upstream request failed"
            );
            let status = match e {
                ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            return error_response(status, &cors);
        }
    };
    metrics::histogram!("proxyd_upstream_latency_seconds").record(start.elapsed().as_secs_f64());

    let captured = match capture(
        state.cache.as_ref(),
        key.clone(),
        cacheable,
        upstream_resp,
        &state.capture,
    )
    .await
    {
        Ok(captured) => captured,
        Err(e) => {
            metrics::counter!("proxyd_upstream_errors_total", "kind" => "body").increment(1);
            tracing::error!(error = ?e, key = %key, "failed to capture upstream response");
            return error_response(StatusCode::BAD_GATEWAY, &cors);
        }
    };

    tracing::debug!(
        key = %key,
        status = captured.status.as_u16(),
        outcome = ?captured.outcome,
        latency_us = start.elapsed().as_micros() as u64,
        "cache MISS → upstream"
    );

    let mut headers = captured.headers;
    cors.apply(&mut headers);
    headers.insert(X_CACHE, CacheStatus::Miss.header_value());

    let mut response = Response::new(captured.body);
    *response.status_mut() = captured.status;
    *response.headers_mut() = headers;
    response
}

/// Replay a cached entry: stored headers, fresh CORS and `Age`, status 200.
fn hit_response(entry: &CachedEntry, cors: &CorsHeaders, client_max_age: Duration) -> Response<Body> {
    let mut headers = entry.headers.clone();
    headers::refresh_age(&mut headers, entry.age(), client_max_age);
    cors.apply(&mut headers);
    headers.insert(X_CACHE, CacheStatus::Hit.header_value());

    let mut response = Response::new(Body::from(entry.body.clone()));
    *response.headers_mut() = headers;
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

/// Fixed-text error so internal details never reach the client. CORS
/// headers are still set so browsers can read the status.
fn error_response(status: StatusCode, cors: &CorsHeaders) -> Response<Body> {
    let text = match status {
        StatusCode::GATEWAY_TIMEOUT => "Gateway Timeout",
        _ => "Bad Gateway",
    };
    let mut response = plain(status, text);
    cors.apply(response.headers_mut());
    response
}
