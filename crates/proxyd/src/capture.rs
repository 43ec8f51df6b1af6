use crate::headers;
use axum::body::Body;
use axum::BoxError;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body as HttpBody, Frame};
use proxyd_cache::{CacheKey, CachedEntry, ResponseCache};
use std::time::Duration;

/// Limits applied while capturing an upstream response.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Responses larger than this are delivered but never cached.
    pub max_body_size: u64,
    /// `max-age` advertised to downstream caches.
    pub client_max_age: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024,
            client_max_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("error reading proxied response body")]
    BodyRead(#[source] BoxError),
}

/// What the capture stage did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Stored,
    /// Not a 200, not a GET, or the upstream forbade shared caching.
    Ineligible,
    Oversized,
    StoreFailed,
}

/// A rewritten upstream response, ready for the client once CORS and the
/// cache-status marker are added.
pub struct Captured {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    pub outcome: CaptureOutcome,
}

/// Intercept an upstream response before it reaches the client.
///
/// The header set is always rewritten. Eligible responses are buffered in
/// full, stored under `key`, and handed back with a body rebuilt from the
/// buffer. Everything else streams through untouched. Body read errors fail
/// the request; store errors only skip caching.
pub async fn capture<B>(
    cache: &dyn ResponseCache,
    key: CacheKey,
    cacheable_request: bool,
    upstream: Response<B>,
    settings: &CaptureSettings,
) -> Result<Captured, CaptureError>
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    let (parts, mut body) = upstream.into_parts();
    let rewritten = headers::rewrite_upstream(&parts.headers, settings.client_max_age);

    let passthrough = |headers: HeaderMap, body: Body, outcome: CaptureOutcome| Captured {
        status: parts.status,
        headers,
        body,
        outcome,
    };

    if !cacheable_request
        || parts.status != StatusCode::OK
        || !headers::upstream_allows_caching(&parts.headers)
    {
        return Ok(passthrough(rewritten, Body::new(body), CaptureOutcome::Ineligible));
    }

    if let Some(declared) = declared_length(&parts.headers) {
        if declared > settings.max_body_size {
            tracing::warn!(
                key = %key,
                content_length = declared,
                limit = settings.max_body_size,
                "response too large, not caching"
            );
            metrics::counter!("proxyd_cache_skipped_total", "reason" => "oversized").increment(1);
            return Ok(passthrough(rewritten, Body::new(body), CaptureOutcome::Oversized));
        }
    }

    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| CaptureError::BodyRead(e.into()))?;
        let Ok(data) = frame.into_data() else {
            // Trailers are not cached.
            continue;
        };
        buf.extend_from_slice(&data);

        if buf.len() as u64 > settings.max_body_size {
            // No declared length and it kept growing: hand the client what
            // was read so far followed by the rest of the stream.
            tracing::warn!(
                key = %key,
                buffered = buf.len(),
                limit = settings.max_body_size,
                "response exceeded size limit while buffering, not caching"
            );
            metrics::counter!("proxyd_cache_skipped_total", "reason" => "oversized").increment(1);
            let head = stream::once(async move { Ok::<_, B::Error>(Frame::data(buf.freeze())) });
            let rest = head.chain(BodyStream::new(body));
            return Ok(passthrough(
                rewritten,
                Body::new(StreamBody::new(rest)),
                CaptureOutcome::Oversized,
            ));
        }
    }

    let bytes = buf.freeze();
    let entry = CachedEntry::new(bytes.clone(), headers::for_storage(&rewritten));
    let outcome = match cache.put(key.clone(), entry) {
        Ok(()) => {
            tracing::debug!(key = %key, size = bytes.len(), "response stored");
            metrics::counter!("proxyd_cache_stores_total").increment(1);
            CaptureOutcome::Stored
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "error storing response in cache");
            metrics::counter!("proxyd_cache_skipped_total", "reason" => "store_failed")
                .increment(1);
            CaptureOutcome::StoreFailed
        }
    };

    Ok(passthrough(rewritten, Body::from(bytes), outcome))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
