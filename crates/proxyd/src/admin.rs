use crate::proxy::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use proxyd_cache::ResponseCache;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// State for the admin router (separate port from the proxy).
#[derive(Clone)]
pub struct MetricsState {
    pub app: Arc<AppState>,
    pub prometheus: PrometheusHandle,
    pub started: Instant,
}

/// One-shot view of the response store.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub stores: u64,
    pub expirations: u64,
    pub size: usize,
    pub ttl_seconds: u64,
    pub cors_mode: String,
    pub uptime_seconds: u64,
}

impl StatsSnapshot {
    fn collect(state: &MetricsState) -> Self {
        let stats = state.app.cache.stats();
        StatsSnapshot {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_rate(),
            stores: stats.stores,
            expirations: stats.expirations,
            size: stats.current_size,
            ttl_seconds: stats.ttl_seconds,
            cors_mode: format!("{:?}", state.app.cors.load().mode()).to_lowercase(),
            uptime_seconds: state.started.elapsed().as_secs(),
        }
    }
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/metrics", get(prometheus_handler))
        .with_state(state)
}

/// GET /api/stats
pub async fn stats_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    Json(StatsSnapshot::collect(&state))
}

/// GET /metrics: Prometheus text format.
pub async fn prometheus_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let stats = state.app.cache.stats();
    metrics::gauge!("proxyd_cache_entries").set(stats.current_size as f64);
    state.prometheus.render()
}

/// Background task that drops expired entries every `every` until shutdown.
pub async fn expiry_sweeper(
    cache: Arc<dyn ResponseCache>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = cache.purge_expired();
                if removed > 0 {
                    metrics::counter!("proxyd_cache_expired_total").increment(removed as u64);
                    tracing::debug!(removed, "expired entries swept");
                }
            }
        }
    }

    tracing::debug!("expiry sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSettings;
    use crate::config::Config;
    use crate::upstream::{build_client, Upstream};
    use arc_swap::ArcSwap;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use http::HeaderMap;
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use proxyd_cache::{CacheKey, CachedEntry, ShardedStore};
    use tower::ServiceExt;

    fn state(cache: Arc<dyn ResponseCache>) -> MetricsState {
        let config = Config::default_config();
        let app = AppState {
            cache,
            client: build_client().unwrap(),
            upstream: Upstream::from_config(&config).unwrap(),
            cors: ArcSwap::from_pointee(config.access_control_policy().unwrap()),
            capture: CaptureSettings::default(),
            path_prefix: None,
        };
        MetricsState {
            app: Arc::new(app),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
            started: Instant::now(),
        }
    }

    #[tokio::test]
    async fn stats_reports_store_counters() {
        let cache = Arc::new(ShardedStore::new(Duration::from_secs(60)));
        let key = CacheKey::new("/api/v3/ping", None);
        cache
            .put(key.clone(), CachedEntry::new(Bytes::from_static(b"{}"), HeaderMap::new()))
            .unwrap();
        cache.get(&key);
        cache.get(&CacheKey::new("/missing", None));

        let app = router(state(cache));
        let resp = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["hits"], 1);
        assert_eq!(json["misses"], 1);
        assert_eq!(json["size"], 1);
        assert_eq!(json["ttl_seconds"], 60);
        assert_eq!(json["cors_mode"], "open");
    }

    #[tokio::test]
    async fn prometheus_endpoint_renders() {
        let cache = Arc::new(ShardedStore::new(Duration::from_secs(60)));
        let resp = router(state(cache))
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sweeper_purges_and_stops_on_shutdown() {
        let cache = Arc::new(ShardedStore::new(Duration::from_millis(10)));
        for i in 0..5 {
            cache
                .put(
                    CacheKey::new(&format!("/k/{i}"), None),
                    CachedEntry::new(Bytes::new(), HeaderMap::new()),
                )
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(expiry_sweeper(
            cache.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
