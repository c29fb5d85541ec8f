use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{app_state::AppState, metrics::{IncomingSnapshot, MetricsSnapshot}};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/metrics", get(combined))
        .route("/api/metrics/reset", post(reset))
        .route("/api/metrics/outgoing", get(outgoing))
        .route("/api/metrics/incoming", get(incoming))
}

async fn combined(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "outgoing": state.outgoing.snapshot(),
        "incoming": state.incoming.snapshot(),
        "scheduler": state.scheduler.stats(),
    }))
}

async fn outgoing(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.outgoing.snapshot())
}

async fn incoming(State(state): State<AppState>) -> Json<IncomingSnapshot> {
    Json(state.incoming.snapshot())
}

async fn reset(State(state): State<AppState>) -> StatusCode {
    state.outgoing.reset();
    state.incoming.reset();
    StatusCode::NO_CONTENT
}
