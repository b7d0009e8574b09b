//! Admin API for the token pool
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and has no
//! authentication of its own; keep it off public interfaces.
//!
//! Endpoints:
//! - GET  /admin/tokens/stats: pool snapshot, no credential values
//! - POST /admin/tokens/reset/{index}: reactivate one token
//! - POST /admin/tokens/reset-all: reactivate every token
//! - POST /admin/tokens/refresh: sign in again and swap the pool
//! - POST /admin/tokens/reload: rebuild from the last fetched set
//! - GET  /admin/tokens/consecutive-failures: pool-wide counters and thresholds
//! - POST /admin/tokens/reset-consecutive: zero the pool-wide counters
//! - GET  /admin/tokens/refresher: refresher state

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use token_pool::{RefreshOutcome, Refresher, TokenPool};
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    pool: Arc<TokenPool>,
    refresher: Refresher,
}

impl AdminState {
    pub fn new(pool: Arc<TokenPool>, refresher: Refresher) -> Self {
        Self { pool, refresher }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens/stats", get(stats))
        .route("/admin/tokens/reset/{index}", post(reset_token))
        .route("/admin/tokens/reset-all", post(reset_all))
        .route("/admin/tokens/refresh", post(force_refresh))
        .route("/admin/tokens/reload", post(reload_cached))
        .route("/admin/tokens/consecutive-failures", get(consecutive_failures))
        .route("/admin/tokens/reset-consecutive", post(reset_consecutive))
        .route("/admin/tokens/refresher", get(refresher_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: Value) -> impl IntoResponse {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

fn outcome_response(outcome: RefreshOutcome) -> impl IntoResponse {
    match outcome {
        RefreshOutcome::Replaced { tokens } => json_response(
            StatusCode::OK,
            json!({ "status": "replaced", "tokens": tokens }),
        ),
        RefreshOutcome::Unchanged { reason } => json_response(
            StatusCode::BAD_GATEWAY,
            json!({ "status": "unchanged", "error": reason }),
        ),
        RefreshOutcome::Skipped => json_response(
            StatusCode::CONFLICT,
            json!({ "status": "skipped", "error": "a refresh is already in progress" }),
        ),
    }
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.pool.stats().await;
    json_response(StatusCode::OK, json!(stats))
}

async fn reset_token(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    match state.pool.reset_token(index).await {
        Ok(()) => {
            info!(index, "token reset via admin");
            json_response(StatusCode::OK, json!({ "status": "reset", "index": index }))
        }
        Err(e) => json_response(StatusCode::NOT_FOUND, json!({ "error": e.to_string() })),
    }
}

async fn reset_all(State(state): State<AdminState>) -> impl IntoResponse {
    let tokens = state.pool.reset_all().await;
    info!(tokens, "all tokens reset via admin");
    json_response(StatusCode::OK, json!({ "status": "reset", "tokens": tokens }))
}

/// POST /admin/tokens/refresh: waits for the sign-in round to finish.
async fn force_refresh(State(state): State<AdminState>) -> impl IntoResponse {
    outcome_response(state.refresher.refresh_now("admin").await)
}

async fn reload_cached(State(state): State<AdminState>) -> impl IntoResponse {
    outcome_response(state.pool.restore_cached().await)
}

async fn consecutive_failures(State(state): State<AdminState>) -> impl IntoResponse {
    let status = state.pool.consecutive_status().await;
    json_response(StatusCode::OK, json!(status))
}

async fn reset_consecutive(State(state): State<AdminState>) -> impl IntoResponse {
    let (failures, upstream_errors) = state.pool.reset_consecutive().await;
    info!(failures, upstream_errors, "consecutive counters reset via admin");
    json_response(
        StatusCode::OK,
        json!({
            "status": "reset",
            "previous": {
                "consecutive_failures": failures,
                "consecutive_upstream_errors": upstream_errors,
            }
        }),
    )
}

async fn refresher_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, json!(state.refresher.status()))
}
