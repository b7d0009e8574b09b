//! K2Think OpenAI-compatible proxy
//!
//! Single-binary Rust service that:
//! 1. Signs the configured K2Think accounts in and pools their session tokens
//! 2. Serves `/v1/chat/completions` and `/v1/models` in the OpenAI shape
//! 3. Rotates tokens per request, retrying and refreshing the pool on failure
//! 4. Exposes pool administration on a separate loopback listener

mod admin;
mod chat;
mod config;
mod cors;
mod error;
mod metrics;
mod orchestrator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use common::Secret;
use k2think_auth::{AccountLoginSource, SignInClient};
use metrics_exporter_prometheus::PrometheusHandle;
use token_pool::{RefreshOutcome, Refresher, TokenPool, spawn_refresh_task};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::K2ThinkClient;

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, ServerConfig};
use crate::cors::cors_layer;
use crate::metrics::ServiceMetrics;
use crate::orchestrator::{Orchestrator, RetryPolicy};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    pool: Arc<TokenPool>,
    refresher: Refresher,
    api_key: Arc<Secret<String>>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the public router. `server.max_connections` caps concurrent requests.
fn build_router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/models", get(chat::list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .layer(tower::limit::ConcurrencyLimitLayer::new(server.max_connections))
        .layer(cors_layer(&server.cors_origins))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL, then RUST_LOG, then info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting k2think-proxy");

    // Install before the pool publishes its first gauge
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let config = if config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else if cli_config_path.is_none() && std::env::var_os("CONFIG_PATH").is_none() {
        info!(path = %config_path.display(), "no config file, using defaults");
        Config::from_toml("").context("failed to build default config")?
    } else {
        anyhow::bail!("config file {} does not exist", config_path.display());
    };

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        upstream_url = %config.upstream.url,
        accounts_file = %config.refresh.accounts_file.display(),
        max_attempts = config.retry.max_attempts,
        "configuration loaded"
    );

    let api_key = config
        .server
        .api_key
        .clone()
        .context("API key missing after config load")?;

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let source = AccountLoginSource::new(
        config.refresh.accounts_file.clone(),
        SignInClient::new(http.clone(), config.refresh.signin_url.clone()),
        config.refresh.max_workers,
    );
    let pool = Arc::new(TokenPool::new(config.pool.thresholds(), Arc::new(source)));
    let refresher = Refresher::install(
        &pool,
        Duration::from_secs(config.refresh.interval_secs),
    );

    // An empty first generation is not fatal: requests get 503 until a
    // later refresh succeeds.
    match refresher.refresh_now("startup").await {
        RefreshOutcome::Replaced { tokens } => info!(tokens, "initial token pool loaded"),
        RefreshOutcome::Unchanged { reason } => {
            warn!(error = %reason, "initial refresh produced no tokens, starting with empty pool")
        }
        RefreshOutcome::Skipped => {}
    }
    let refresh_task = spawn_refresh_task(refresher.clone());

    let upstream = K2ThinkClient::new(
        http,
        config.upstream.url.clone(),
        Duration::from_secs(config.upstream.timeout_secs),
    );
    let orchestrator = Orchestrator::new(
        pool.clone(),
        Arc::new(upstream),
        RetryPolicy {
            max_attempts: config.retry.max_attempts,
            backoff: Duration::from_millis(config.retry.backoff_ms),
        },
        config.stream.pacing(),
        None,
    );

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        orchestrator: Arc::new(orchestrator),
        pool: pool.clone(),
        refresher: refresher.clone(),
        api_key: Arc::new(api_key),
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, &config.server);
    let admin_app = build_admin_router(AdminState::new(pool, refresher));

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    let admin_addr = config.server.admin_listen_addr;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;

    info!(addr = %listen_addr, admin_addr = %admin_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async {
                let _ = admin_shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    refresh_task.abort();
    let _ = admin_shutdown_tx.send(());
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
                remaining = metrics.in_flight(),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }
    if let Ok(Ok(Err(e))) = tokio::time::timeout(Duration::from_secs(1), admin_handle).await {
        error!(error = %e, "admin server error during shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

/// GET /
async fn index_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "service": "k2think-proxy",
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": {
                "chat": "/v1/chat/completions",
                "models": "/v1/models",
                "health": "/health",
                "metrics": "/metrics",
            }
        })
        .to_string(),
    )
}

/// Health endpoint. 200 while at least one token is active, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    use std::sync::atomic::Ordering;

    let stats = state.pool.stats().await;
    let status_code = if stats.active_tokens > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if status_code == StatusCode::OK { "healthy" } else { "degraded" },
        "tokens": {
            "total": stats.total_tokens,
            "active": stats.active_tokens,
            "inactive": stats.inactive_tokens,
        },
        "refreshing": state.refresher.is_refreshing(),
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
