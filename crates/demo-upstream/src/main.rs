use axum::extract::Query;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Just over the proxy's default 10 MiB capture ceiling.
const LARGE_BODY_BYTES: usize = 10 * 1024 * 1024 + 1;

#[derive(Deserialize)]
struct CoinsQuery {
    #[serde(default)]
    ids: String,
}

#[derive(Deserialize)]
struct PriceQuery {
    #[serde(default)]
    ids: String,
    #[serde(default = "default_currency")]
    vs_currencies: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

async fn simulate_latency() -> u64 {
    // Simulate upstream latency (20-80ms)
    let delay = rand::thread_rng().gen_range(20..=80);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    delay
}

fn price_for(id: &str) -> f64 {
    let seed: u64 = id.bytes().map(u64::from).sum();
    (seed % 5000) as f64 + rand::thread_rng().gen_range(0.0..1.0)
}

async fn coins(headers: HeaderMap, Query(q): Query<CoinsQuery>) -> Json<Value> {
    let delay = simulate_latency().await;
    let authenticated = headers.contains_key("x-cg-pro-api-key");
    tracing::info!(ids = %q.ids, authenticated, "coins");

    let coins: Vec<Value> = q
        .ids
        .split(',')
        .filter(|id| !id.is_empty())
        .map(|id| {
            json!({
                "id": id,
                "symbol": id.chars().take(3).collect::<String>(),
                "current_price": price_for(id),
            })
        })
        .collect();

    Json(json!({
        "coins": coins,
        "latency_ms": delay,
        "authenticated": authenticated,
    }))
}

async fn simple_price(Query(q): Query<PriceQuery>) -> Json<Value> {
    simulate_latency().await;
    let mut out = serde_json::Map::new();
    for id in q.ids.split(',').filter(|id| !id.is_empty()) {
        let mut prices = serde_json::Map::new();
        for currency in q.vs_currencies.split(',').filter(|c| !c.is_empty()) {
            prices.insert(currency.to_string(), json!(price_for(id)));
        }
        out.insert(id.to_string(), Value::Object(prices));
    }
    Json(Value::Object(out))
}

/// A response too large for the proxy to cache.
async fn large() -> impl IntoResponse {
    (
        [("content-type", "application/octet-stream")],
        vec![b'x'; LARGE_BODY_BYTES],
    )
}

async fn ping() -> Json<Value> {
    Json(json!({ "gecko_says": "(V3) To the Moon!" }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/api/v3/ping", get(ping))
        .route("/api/v3/coins", get(coins))
        .route("/api/v3/simple/price", get(simple_price))
        .route("/api/v3/large", get(large));

    let addr = std::env::var("DEMO_UPSTREAM_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    tracing::info!(addr = %addr, "demo upstream starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind demo upstream to {addr}: {e}"));
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "demo upstream server error");
    }
}
