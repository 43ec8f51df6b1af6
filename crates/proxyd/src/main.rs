mod admin;
mod capture;
mod config;
mod cors;
mod headers;
mod proxy;
mod upstream;

use admin::{expiry_sweeper, MetricsState};
use arc_swap::ArcSwap;
use capture::CaptureSettings;
use config::{Config, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::AppState;
use proxyd_cache::{ResponseCache, ShardedStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use upstream::{build_client, Upstream};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load config
    let config_path = PathBuf::from(
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let mut config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(c) => {
                tracing::info!(path = %config_path.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, path = %config_path.display(), "failed to load config");
                std::process::exit(1);
            }
        }
    } else {
        tracing::info!(path = %config_path.display(), "no config file found, using defaults");
        Config::default_config()
    };

    if let Err(e) = config.apply_env().and_then(|_| config.validate()) {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }
    if config.cache.ttl_seconds == 0 {
        tracing::warn!("cache.ttl_seconds is 0, responses will not be cached");
    }

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    let (upstream, cors) = match (Upstream::from_config(&config), config.access_control_policy()) {
        (Ok(u), Ok(c)) => (u, c),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    // Build HTTP(S) client for upstream requests
    let client = match build_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream TLS client");
            std::process::exit(1);
        }
    };

    let cache: Arc<dyn ResponseCache> = Arc::new(ShardedStore::new(config.ttl()));

    let state = Arc::new(AppState {
        cache: Arc::clone(&cache),
        client,
        upstream,
        cors: ArcSwap::from_pointee(cors),
        capture: CaptureSettings {
            max_body_size: config.cache.max_body_size_bytes,
            client_max_age: Duration::from_secs(config.cache.client_max_age_seconds),
        },
        path_prefix: config.server.path_prefix.clone(),
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    tokio::spawn(expiry_sweeper(
        Arc::clone(&cache),
        Duration::from_secs(config.cache.sweep_interval_seconds),
        shutdown.clone(),
    ));

    let metrics_router = admin::router(MetricsState {
        app: Arc::clone(&state),
        prometheus: prom_handle,
        started: Instant::now(),
    });
    let proxy_router = proxy::router(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        api_key = config.upstream.api_key.is_some(),
        ttl_seconds = config.cache.ttl_seconds,
        cors = ?config.cors.mode,
        path_prefix = ?config.server.path_prefix,
        "proxyd starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {proxy_addr}: {e}"));

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind metrics to {metrics_addr}: {e}"));

    // Spawn config file watcher
    spawn_config_watcher(config_path, config, Arc::clone(&state));

    // Spawn shutdown signal handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // Run both servers with graceful shutdown
    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, metrics_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    shutdown.cancel();
    tracing::info!("proxyd shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file and apply safe changes (TTL, CORS) at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "config file absent, not watching");
        return;
    }

    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                reload(&config_path_clone, &current_config, &state);
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config file");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!(path = %config_path.display(), "config file watcher started");
}

fn reload(path: &Path, current: &Mutex<Config>, state: &AppState) {
    let mut new_config = match Config::load(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to reload config");
            return;
        }
    };
    if let Err(e) = new_config.apply_env().and_then(|_| new_config.validate()) {
        tracing::error!(error = %e, "reloaded config is invalid, keeping previous");
        return;
    }

    let mut old = current.lock();
    config::diff_and_apply(&old, &new_config, state);
    *old = new_config;
}
