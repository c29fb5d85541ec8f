use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::{
    app_state::AppState,
    client::TokenStatus,
    config::AuthConfig,
    error::{ApiResult, AppError},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/outgoing/auth-configs",
            get(list_auth_configs).post(create_auth_config),
        )
        .route(
            "/api/outgoing/auth-configs/{name}",
            get(get_auth_config)
                .put(update_auth_config)
                .delete(delete_auth_config),
        )
        .route("/api/outgoing/auth-configs/{name}/token", get(token_status))
        .route(
            "/api/outgoing/auth-configs/{name}/token/refresh",
            post(refresh_token),
        )
}

fn sync_token_manager(state: &AppState) {
    state.tokens.update_auth_configs(state.store.auth_configs());
}

async fn list_auth_configs(State(state): State<AppState>) -> Json<HashMap<String, AuthConfig>> {
    Json(state.store.auth_configs())
}

async fn create_auth_config(
    State(state): State<AppState>,
    Json(auth): Json<AuthConfig>,
) -> ApiResult<(StatusCode, Json<AuthConfig>)> {
    let name = auth.name.clone();
    state.store.add_auth_config(auth)?;
    sync_token_manager(&state);
    let stored = state
        .store
        .auth_config(&name)
        .ok_or_else(|| AppError::internal("auth config vanished after create"))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_auth_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<AuthConfig>> {
    state
        .store
        .auth_config(&name)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("auth config not found: {name}")))
}

async fn update_auth_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(auth): Json<AuthConfig>,
) -> ApiResult<Json<AuthConfig>> {
    let new_name = auth.name.clone();
    state.store.update_auth_config(&name, auth)?;
    sync_token_manager(&state);
    state
        .store
        .auth_config(&new_name)
        .map(Json)
        .ok_or_else(|| AppError::internal("auth config vanished after update"))
}

async fn delete_auth_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_auth_config(&name)?;
    sync_token_manager(&state);
    Ok(StatusCode::NO_CONTENT)
}

async fn token_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<TokenStatus>> {
    if state.store.auth_config(&name).is_none() {
        return Err(AppError::not_found(format!("auth config not found: {name}")));
    }
    sync_token_manager(&state);
    state
        .tokens
        .token_status(&name)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("auth config not found: {name}")))
}

async fn refresh_token(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<TokenStatus>> {
    if state.store.auth_config(&name).is_none() {
        return Err(AppError::not_found(format!("auth config not found: {name}")));
    }
    sync_token_manager(&state);
    state
        .tokens
        .force_refresh(&name)
        .await
        .map_err(|err| AppError::service_unavailable(format!("token refresh failed: {err}")))?;
    state
        .tokens
        .token_status(&name)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("auth config not found: {name}")))
}
