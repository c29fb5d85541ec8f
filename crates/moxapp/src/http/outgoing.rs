use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppState,
    config::Endpoint,
    error::{ApiResult, AppError},
    scheduler::SchedulerStats,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/outgoing/settings", get(get_settings).put(put_settings))
        .route(
            "/api/outgoing/endpoints",
            get(list_endpoints).post(create_endpoint),
        )
        .route(
            "/api/outgoing/endpoints/{name}",
            get(get_endpoint).put(update_endpoint).delete(delete_endpoint),
        )
        .route("/api/outgoing/endpoints/{name}/enable", post(enable_endpoint))
        .route(
            "/api/outgoing/endpoints/{name}/disable",
            post(disable_endpoint),
        )
        .route("/api/outgoing/control", get(control_stats).post(control))
}

#[derive(Debug, Serialize)]
struct SettingsResponse {
    enabled: bool,
    global_multiplier: f64,
    concurrent_requests: usize,
    log_all_requests: bool,
    total_base_requests_per_min: f64,
    adjusted_requests_per_min: f64,
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    enabled: Option<bool>,
    global_multiplier: Option<f64>,
    concurrent_requests: Option<usize>,
    log_all_requests: Option<bool>,
}

fn settings_response(state: &AppState) -> SettingsResponse {
    let config = state.store.snapshot();
    SettingsResponse {
        enabled: config.enabled,
        global_multiplier: config.global_multiplier,
        concurrent_requests: config.concurrent_requests,
        log_all_requests: config.log_all_requests,
        total_base_requests_per_min: config.total_base_requests_per_min(),
        adjusted_requests_per_min: config.adjusted_requests_per_min(),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
    Json(settings_response(&state))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<SettingsResponse>> {
    if let Some(multiplier) = update.global_multiplier {
        if multiplier < 0.0 {
            return Err(AppError::bad_request("global_multiplier must be non-negative"));
        }
        state.store.set_global_multiplier(multiplier);
    }
    if let Some(concurrent) = update.concurrent_requests {
        if concurrent == 0 {
            return Err(AppError::bad_request("concurrent_requests must be positive"));
        }
        state.store.set_concurrent_requests(concurrent);
    }
    if let Some(log) = update.log_all_requests {
        state.store.set_log_all_requests(log);
    }
    if let Some(enabled) = update.enabled {
        state.store.set_enabled(enabled);
    }
    Ok(Json(settings_response(&state)))
}

async fn list_endpoints(State(state): State<AppState>) -> Json<Vec<Endpoint>> {
    Json(state.store.endpoints())
}

async fn create_endpoint(
    State(state): State<AppState>,
    Json(endpoint): Json<Endpoint>,
) -> ApiResult<(StatusCode, Json<Endpoint>)> {
    let name = endpoint.name.clone();
    state.store.add_endpoint(endpoint)?;
    let stored = state
        .store
        .endpoint(&name)
        .ok_or_else(|| AppError::internal("endpoint vanished after create"))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Endpoint>> {
    state
        .store
        .endpoint(&name)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("endpoint not found: {name}")))
}

async fn update_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(endpoint): Json<Endpoint>,
) -> ApiResult<Json<Endpoint>> {
    let new_name = endpoint.name.clone();
    state.store.update_endpoint(&name, endpoint)?;
    state
        .store
        .endpoint(&new_name)
        .map(Json)
        .ok_or_else(|| AppError::internal("endpoint vanished after update"))
}

async fn delete_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_endpoint(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Endpoint>> {
    set_enabled(&state, &name, true)
}

async fn disable_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Endpoint>> {
    set_enabled(&state, &name, false)
}

fn set_enabled(state: &AppState, name: &str, enabled: bool) -> ApiResult<Json<Endpoint>> {
    state.store.set_endpoint_enabled(name, enabled)?;
    state
        .store
        .endpoint(name)
        .map(Json)
        .ok_or_else(|| AppError::internal("endpoint vanished after toggle"))
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: String,
}

async fn control_stats(State(state): State<AppState>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats())
}

async fn control(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<Json<SchedulerStats>> {
    match request.action.as_str() {
        "pause" => state.scheduler.pause(),
        "resume" => state.scheduler.resume(),
        "emergency_stop" => state.scheduler.emergency_stop(),
        other => {
            return Err(AppError::bad_request(format!(
                "unknown action {other:?} (expected pause, resume or emergency_stop)"
            )))
        }
    }
    Ok(Json(state.scheduler.stats()))
}
