use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{app_state::AppState, config::TrafficConfig, error::ApiResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/config/export", get(export_config))
        .route("/api/config/import", post(import_config))
}

async fn export_config(State(state): State<AppState>) -> Json<TrafficConfig> {
    Json(state.store.snapshot())
}

/// Validate the candidate and atomically replace the whole configuration.
async fn import_config(
    State(state): State<AppState>,
    Json(candidate): Json<TrafficConfig>,
) -> ApiResult<Json<Value>> {
    state.store.replace_all(candidate)?;
    state.tokens.update_auth_configs(state.store.auth_configs());

    let config = state.store.snapshot();
    Ok(Json(json!({
        "endpoints": config.endpoints.len(),
        "incoming_routes": config.incoming_routes.len(),
        "auth_configs": config.auth_configs.len(),
    })))
}
