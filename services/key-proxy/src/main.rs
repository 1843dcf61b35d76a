//! Amble Key Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads provider API keys per credential class from the environment
//! 2. Listens for `/{class}/...` requests
//! 3. Injects a pooled key into the class's upstream request
//! 4. Rotates to the next key on quota and auth failures, and answers with a
//!    degraded message once a class runs dry

mod config;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_pool::{RetryPolicy, spawn_status_task};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::{ProxyState, Upstream};

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide counters reported by `/health`
#[derive(Clone)]
struct ServiceMetrics {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Excess concurrent requests queue behind `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/keys/status", get(keys_status_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting amble-key-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstreams = config.upstreams.len(),
        max_attempts = config.proxy.max_attempts,
        cooldown_secs = config.keys.cooldown_secs,
        "configuration loaded"
    );

    let pool = Arc::new(config.build_pool().context("failed to load API keys")?);
    let _status_task = spawn_status_task(
        pool.clone(),
        Duration::from_secs(config.keys.status_interval_secs),
    );

    let mut upstreams = HashMap::with_capacity(config.upstreams.len());
    for upstream in &config.upstreams {
        upstreams.insert(
            upstream.class.clone(),
            Upstream {
                url: upstream.upstream_url.clone(),
                key_header: upstream.header_name()?,
                key_prefix: upstream.key_prefix.clone().unwrap_or_default(),
            },
        );
    }

    let metrics = ServiceMetrics::new();

    let client = proxy::upstream_client().context("failed to build HTTP client")?;

    let proxy_state = ProxyState {
        client,
        pool,
        upstreams: Arc::new(upstreams),
        timeout: Duration::from_secs(config.proxy.timeout_secs),
        retry: RetryPolicy::new(config.proxy.max_attempts),
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while every class has a selectable key, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let keys = state.proxy.pool.get_status();
    let healthy = !keys.is_empty() && keys.values().all(|s| s.available > 0);

    let classes: serde_json::Map<String, serde_json::Value> = keys
        .iter()
        .map(|(class, status)| {
            (
                class.clone(),
                serde_json::json!({
                    "status": status.label(),
                    "total": status.total,
                    "available": status.available,
                    "cooling_down": status.cooling_down,
                    "exhausted": status.exhausted,
                    "ever_exhausted": status.ever_exhausted,
                }),
            )
        })
        .collect();

    let (status_code, label) = if healthy {
        (axum::http::StatusCode::OK, "healthy")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = serde_json::json!({
        "status": label,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "keys": classes,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Per-class key counts as JSON.
async fn keys_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.proxy.pool.get_status())
}

/// Prometheus metrics endpoint; returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies `/{class}/...` requests upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
