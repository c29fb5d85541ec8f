//! Simulated inbound routes under `/sim`.
//!
//! Each request strips the prefix, asks the store for the best-matching
//! route, picks a weighted response, sleeps the simulated delay, records
//! the event and echoes the request back as JSON.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;

use crate::{app_state::AppState, config::ResponseSpec, error::AppError, telemetry};

pub const SIMULATED_ROUTE_PREFIX: &str = "/sim";

const MAX_ECHO_BODY_BYTES: usize = 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sim", any(sim_index))
        .route("/sim/", any(sim_index))
        .route("/sim/{*path}", any(simulate))
}

#[derive(Debug, Serialize)]
struct EchoResponse {
    timestamp: String,
    matched_route: MatchedRoute,
    request: RequestEcho,
    response: ResponseInfo,
}

#[derive(Debug, Serialize)]
struct MatchedRoute {
    name: String,
    path: String,
    method: String,
}

#[derive(Debug, Serialize)]
struct RequestEcho {
    method: String,
    path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    path_suffix: String,
    headers: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_params: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<serde_json::Value>,
    remote_addr: String,
}

#[derive(Debug, Serialize)]
struct ResponseInfo {
    status: u16,
    simulated_delay_ms: f64,
}

/// Bare `/sim` requests get a listing of the enabled routes.
async fn sim_index(State(state): State<AppState>) -> impl IntoResponse {
    let routes: Vec<_> = state
        .store
        .incoming_routes()
        .into_iter()
        .filter(|route| route.enabled)
        .map(|route| {
            json!({
                "name": route.name,
                "path": format!("{SIMULATED_ROUTE_PREFIX}{}", route.path),
                "method": route.method,
                "responses": route.responses.len(),
            })
        })
        .collect();

    Json(json!({
        "description": "Simulated incoming routes endpoint",
        "prefix": SIMULATED_ROUTE_PREFIX,
        "enabled_routes": routes.len(),
        "routes": routes,
    }))
}

async fn simulate(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method;
    let headers = parts.headers;
    let query = parts.uri.query().map(str::to_string);
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let body = axum::body::to_bytes(body, MAX_ECHO_BODY_BYTES)
        .await
        .unwrap_or_default();

    let sim_path = format!("/{path}");

    let Some((route, path_suffix)) = state
        .store
        .match_incoming_route(&sim_path, method.as_str())
    else {
        return AppError::not_found(format!("no matching route found for path: {sim_path}"))
            .into_response();
    };

    let spec = select_weighted_response(&route.responses);
    let delay_ms = random_delay_ms(spec.min_response_ms, spec.max_response_ms);
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    state
        .incoming
        .record(&route.name, &route.path, spec.status, delay_ms as f64);
    telemetry::record_simulated_response(spec.status);

    let status = StatusCode::from_u16(spec.status).unwrap_or(StatusCode::OK);
    // 204/304 must not carry a body.
    if matches!(
        status,
        StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        return status.into_response();
    }

    let echo = EchoResponse {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        matched_route: MatchedRoute {
            name: route.name.clone(),
            path: route.path.clone(),
            method: route.method.clone(),
        },
        request: RequestEcho {
            method: method.to_string(),
            path: sim_path,
            path_suffix,
            headers: echo_headers(&headers),
            query_params: parse_query(query.as_deref()),
            body: parse_body(&body),
            remote_addr,
        },
        response: ResponseInfo {
            status: spec.status,
            simulated_delay_ms: delay_ms as f64,
        },
    };

    (status, Json(echo)).into_response()
}

/// Cumulative-probability pick: the first response whose running share sum
/// exceeds the draw wins; rounding drift falls through to the last one.
fn select_weighted_response(responses: &[ResponseSpec]) -> ResponseSpec {
    if responses.len() == 1 {
        return responses[0].clone();
    }

    let draw: f64 = rand::rng().random();
    let mut cumulative = 0.0;
    for response in responses {
        cumulative += response.share;
        if draw < cumulative {
            return response.clone();
        }
    }

    responses.last().cloned().unwrap_or(ResponseSpec {
        status: 500,
        share: 1.0,
        min_response_ms: 0,
        max_response_ms: 0,
    })
}

fn random_delay_ms(min_ms: u64, max_ms: u64) -> u64 {
    if max_ms <= min_ms {
        return min_ms;
    }
    rand::rng().random_range(min_ms..=max_ms)
}

fn echo_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for key in headers.keys() {
        if key.as_str().eq_ignore_ascii_case("authorization") {
            out.insert(key.to_string(), vec!["[REDACTED]".to_string()]);
            continue;
        }
        let values = headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        out.insert(key.to_string(), values);
    }
    out
}

fn parse_query(query: Option<&str>) -> Option<BTreeMap<String, Vec<String>>> {
    let query = query?;
    if query.is_empty() {
        return None;
    }
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        out.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    Some(out)
}

/// Bodies that parse as JSON echo as JSON; anything else echoes as the raw
/// string; empty bodies are omitted.
fn parse_body(body: &Bytes) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(
            String::from_utf8_lossy(body).into_owned(),
        )),
    }
}
