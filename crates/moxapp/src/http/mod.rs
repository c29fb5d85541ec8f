//! Management REST surface and the simulated inbound responder.
//!
//! Handlers are thin adapters: they marshal requests into the store,
//! scheduler, token manager and collectors, and map `StoreError` onto the
//! 400/404/409 codes via `AppError`.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::app_state::AppState;

mod auth;
mod config_io;
mod incoming;
mod metrics;
mod outgoing;
mod sim;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(metrics::router())
        .merge(outgoing::router())
        .merge(auth::router())
        .merge(incoming::router())
        .merge(config_io::router())
        .merge(sim::router())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.scheduler.is_running();
    Json(json!({
        "status": if running { "ok" } else { "degraded" },
        "version": crate::VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "scheduler": state.scheduler.stats(),
        "incoming_enabled": state.store.is_incoming_enabled(),
    }))
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}
