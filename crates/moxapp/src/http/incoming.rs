use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    app_state::AppState,
    config::IncomingRoute,
    error::{ApiResult, AppError},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/incoming/control",
            get(get_control).put(put_control),
        )
        .route("/api/incoming/routes", get(list_routes).post(create_route))
        .route("/api/incoming/routes/reload", post(reload_routes))
        .route(
            "/api/incoming/routes/{name}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/api/incoming/routes/{name}/enable", post(enable_route))
        .route("/api/incoming/routes/{name}/disable", post(disable_route))
}

#[derive(Debug, Deserialize)]
struct ControlUpdate {
    enabled: bool,
}

async fn get_control(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "enabled": state.store.is_incoming_enabled(),
        "routes": state.store.incoming_routes().len(),
    }))
}

async fn put_control(
    State(state): State<AppState>,
    Json(update): Json<ControlUpdate>,
) -> Json<Value> {
    state.store.set_incoming_enabled(update.enabled);
    Json(json!({ "enabled": state.store.is_incoming_enabled() }))
}

async fn list_routes(State(state): State<AppState>) -> Json<Vec<IncomingRoute>> {
    Json(state.store.incoming_routes())
}

async fn create_route(
    State(state): State<AppState>,
    Json(route): Json<IncomingRoute>,
) -> ApiResult<(StatusCode, Json<IncomingRoute>)> {
    let name = route.name.clone();
    state.store.add_incoming_route(route)?;
    let stored = state
        .store
        .incoming_route(&name)
        .ok_or_else(|| AppError::internal("route vanished after create"))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<IncomingRoute>> {
    state
        .store
        .incoming_route(&name)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("incoming route not found: {name}")))
}

async fn update_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(route): Json<IncomingRoute>,
) -> ApiResult<Json<IncomingRoute>> {
    let new_name = route.name.clone();
    state.store.update_incoming_route(&name, route)?;
    state
        .store
        .incoming_route(&new_name)
        .map(Json)
        .ok_or_else(|| AppError::internal("route vanished after update"))
}

async fn delete_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_incoming_route(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<IncomingRoute>> {
    set_enabled(&state, &name, true)
}

async fn disable_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<IncomingRoute>> {
    set_enabled(&state, &name, false)
}

fn set_enabled(state: &AppState, name: &str, enabled: bool) -> ApiResult<Json<IncomingRoute>> {
    state.store.set_incoming_route_enabled(name, enabled)?;
    state
        .store
        .incoming_route(name)
        .map(Json)
        .ok_or_else(|| AppError::internal("route vanished after toggle"))
}

/// Re-read the configured YAML path and swap in its routes.
async fn reload_routes(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let count = state
        .store
        .reload_incoming_routes()
        .map_err(|err| AppError::bad_request(format!("reload failed: {err}")))?;
    Ok(Json(json!({ "reloaded_routes": count })))
}
