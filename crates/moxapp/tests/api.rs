//! Router-level integration tests for the management API and the
//! simulated inbound surface.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request as HttpRequest, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use tokio_util::sync::CancellationToken;

use moxapp::{
    app_state::AppState,
    client::{RequestExecutor, RequestResult, TokenManager},
    config::{ConfigStore, Endpoint, TrafficConfig},
    envfile::EnvSource,
    http::build_router,
    metrics::{IncomingCollector, OutgoingCollector},
    scheduler::{ResultHandler, Scheduler},
    telemetry,
};

struct NullExecutor;

impl RequestExecutor for NullExecutor {
    fn execute<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        _deadline: Duration,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = RequestResult> + Send + 'a>> {
        Box::pin(async move {
            RequestResult {
                endpoint_name: endpoint.name.clone(),
                url: endpoint.url_template.clone(),
                method: endpoint.method.clone(),
                status_code: 200,
                success: true,
                error: None,
                error_kind: None,
                total_time_ms: 1.0,
                dns_time_ms: 0.0,
                connect_time_ms: 0.0,
                tls_time_ms: 0.0,
                time_to_first_byte_ms: 1.0,
                hostname: "test.invalid".to_string(),
                response_size: 0,
                request_timestamp: Utc::now(),
            }
        })
    }
}

fn setup_with_store(store: Arc<ConfigStore>) -> Router {
    let env = EnvSource::default();
    let tokens =
        Arc::new(TokenManager::new(store.auth_configs(), env.clone()).expect("token manager"));
    let outgoing = Arc::new(OutgoingCollector::new());
    let incoming = Arc::new(IncomingCollector::new());
    let handler: ResultHandler = Arc::new(|_result| {});
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(NullExecutor), handler);

    let state = AppState::new(
        store,
        scheduler,
        outgoing,
        incoming,
        tokens,
        env,
        telemetry::init_metrics_recorder(),
    );
    build_router(state)
}

fn setup_app() -> Router {
    setup_with_store(Arc::new(ConfigStore::new()))
}

fn setup_with_config(config: TrafficConfig) -> Router {
    setup_with_store(Arc::new(ConfigStore::with_config(config)))
}

async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = HttpRequest::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request builds"))
        .await
        .expect("request executes");

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

fn sample_route(name: &str, path: &str, status: u16) -> Value {
    json!({
        "name": name,
        "path": path,
        "method": "GET",
        "responses": [
            {"status": status, "share": 1.0, "min_response_ms": 0, "max_response_ms": 0}
        ]
    })
}

#[tokio::test]
async fn health_reports_version_and_scheduler_state() {
    let app = setup_app();
    let (status, body) = request(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], moxapp::VERSION);
    assert_eq!(body["status"], "degraded"); // scheduler loop not running here
    assert_eq!(body["scheduler"]["requests_scheduled"], 0);
    assert_eq!(body["incoming_enabled"], true);
}

#[tokio::test]
async fn endpoint_crud_over_the_api() {
    let app = setup_app();

    let endpoint = json!({
        "name": "users",
        "url_template": "http://localhost:9000/users",
        "frequency": 60
    });
    let (status, created) =
        request(&app, "POST", "/api/outgoing/endpoints", Some(endpoint.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    // Defaults applied on create.
    assert_eq!(created["method"], "GET");
    assert_eq!(created["timeout"], 30);
    assert_eq!(created["enabled"], true);

    let (status, body) =
        request(&app, "POST", "/api/outgoing/endpoints", Some(endpoint)).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let (status, list) = request(&app, "GET", "/api/outgoing/endpoints", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let update = json!({
        "name": "users",
        "url_template": "http://localhost:9000/users/v2",
        "frequency": 120
    });
    let (status, updated) =
        request(&app, "PUT", "/api/outgoing/endpoints/users", Some(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["frequency"], 120.0);

    let bad = json!({
        "name": "bad",
        "url_template": "http://localhost/x",
        "frequency": -5
    });
    let (status, body) = request(&app, "POST", "/api/outgoing/endpoints", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, toggled) =
        request(&app, "POST", "/api/outgoing/endpoints/users/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["enabled"], false);

    let (status, _) = request(&app, "DELETE", "/api/outgoing/endpoints/users", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = request(&app, "GET", "/api/outgoing/endpoints/users", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_config_delete_is_refused_while_referenced() {
    let app = setup_app();

    let auth = json!({
        "name": "svc",
        "type": "bearer",
        "env_var": "API_TOKEN"
    });
    let (status, body) =
        request(&app, "POST", "/api/outgoing/auth-configs", Some(auth)).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let endpoint = json!({
        "name": "secure",
        "url_template": "http://localhost/secure",
        "frequency": 1,
        "auth": "svc"
    });
    let (status, body) =
        request(&app, "POST", "/api/outgoing/endpoints", Some(endpoint)).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let (status, body) =
        request(&app, "DELETE", "/api/outgoing/auth-configs/svc", None).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let (status, _) = request(&app, "DELETE", "/api/outgoing/endpoints/secure", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = request(&app, "DELETE", "/api/outgoing/auth-configs/svc", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn token_status_for_static_env_auth() {
    let app = setup_app();

    let auth = json!({
        "name": "static",
        "type": "bearer",
        "env_var": "SOME_TOKEN"
    });
    let (status, _) = request(&app, "POST", "/api/outgoing/auth-configs", Some(auth)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) =
        request(&app, "GET", "/api/outgoing/auth-configs/static/token", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_token"], true);

    let (status, _) =
        request(&app, "GET", "/api/outgoing/auth-configs/ghost/token", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn incoming_route_validation_and_toggle() {
    let app = setup_app();

    let (status, body) = request(
        &app,
        "POST",
        "/api/incoming/routes",
        Some(sample_route("ping", "/ping", 200)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    // Shares that do not sum to 1 are rejected.
    let bad = json!({
        "name": "broken",
        "path": "/broken",
        "method": "GET",
        "responses": [
            {"status": 200, "share": 0.5, "min_response_ms": 0, "max_response_ms": 0}
        ]
    });
    let (status, body) = request(&app, "POST", "/api/incoming/routes", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, toggled) =
        request(&app, "POST", "/api/incoming/routes/ping/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["enabled"], false);

    let (status, toggled) =
        request(&app, "POST", "/api/incoming/routes/ping/enable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["enabled"], true);
}

#[tokio::test]
async fn settings_update_and_validation() {
    let app = setup_app();

    let (status, settings) = request(&app, "GET", "/api/outgoing/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["global_multiplier"], 1.0);
    assert_eq!(settings["concurrent_requests"], 30);

    let update = json!({"global_multiplier": 2.5, "concurrent_requests": 5, "log_all_requests": true});
    let (status, settings) =
        request(&app, "PUT", "/api/outgoing/settings", Some(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["global_multiplier"], 2.5);
    assert_eq!(settings["concurrent_requests"], 5);
    assert_eq!(settings["log_all_requests"], true);

    let (status, body) = request(
        &app,
        "PUT",
        "/api/outgoing/settings",
        Some(json!({"global_multiplier": -1.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, body) = request(
        &app,
        "PUT",
        "/api/outgoing/settings",
        Some(json!({"concurrent_requests": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
}

#[tokio::test]
async fn scheduler_control_actions() {
    let app = setup_app();

    let (status, stats) = request(
        &app,
        "POST",
        "/api/outgoing/control",
        Some(json!({"action": "pause"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["paused"], true);
    assert_eq!(stats["global_enabled"], false);

    let (status, stats) = request(
        &app,
        "POST",
        "/api/outgoing/control",
        Some(json!({"action": "resume"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["paused"], false);
    assert_eq!(stats["global_enabled"], true);

    let (status, body) = request(
        &app,
        "POST",
        "/api/outgoing/control",
        Some(json!({"action": "explode"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
}

#[tokio::test]
async fn export_import_round_trip_is_semantically_stable() {
    let yaml = r#"
global_multiplier: 0.5
auth_configs:
  svc:
    type: bearer
    env_var: API_TOKEN
outgoing_endpoints:
  - name: users
    url_template: http://localhost/users
    frequency: 30
    auth: svc
incoming_routes:
  - name: ping
    path: /ping
    method: "*"
    responses:
      - status: 200
        share: 1.0
"#;
    let config: TrafficConfig = serde_yaml::from_str(yaml).unwrap();
    let app = setup_with_config(config);

    let (status, exported) = request(&app, "GET", "/api/config/export", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, summary) =
        request(&app, "POST", "/api/config/import", Some(exported.clone())).await;
    assert_eq!(status, StatusCode::OK, "{summary}");
    assert_eq!(summary["endpoints"], 1);
    assert_eq!(summary["incoming_routes"], 1);
    assert_eq!(summary["auth_configs"], 1);

    let (_, reexported) = request(&app, "GET", "/api/config/export", None).await;
    assert_eq!(exported, reexported);

    // Importing a broken candidate leaves the store untouched.
    let mut broken = exported.clone();
    broken["outgoing_endpoints"][0]["frequency"] = json!(-1);
    let (status, body) = request(&app, "POST", "/api/config/import", Some(broken)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    let (_, after) = request(&app, "GET", "/api/config/export", None).await;
    assert_eq!(after, exported);
}

#[tokio::test]
async fn sim_longest_prefix_routing() {
    let app = setup_app();

    let api = json!({
        "name": "api",
        "path": "/api",
        "method": "GET",
        "responses": [{"status": 204, "share": 1.0, "min_response_ms": 0, "max_response_ms": 0}]
    });
    let users = json!({
        "name": "api-users",
        "path": "/api/users",
        "method": "GET",
        "responses": [{"status": 200, "share": 1.0, "min_response_ms": 0, "max_response_ms": 0}]
    });
    for route in [api, users] {
        let (status, body) = request(&app, "POST", "/api/incoming/routes", Some(route)).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
    }

    let (status, echo) = request(&app, "GET", "/sim/api/users/42", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(echo["matched_route"]["name"], "api-users");
    assert_eq!(echo["request"]["path_suffix"], "/42");
    assert_eq!(echo["response"]["status"], 200);

    let (status, _) = request(&app, "GET", "/sim/api/orders", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = request(&app, "GET", "/sim/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string(), "{body}");
}

#[tokio::test]
async fn sim_echo_redacts_authorization_and_echoes_the_request() {
    let app = setup_app();

    let route = json!({
        "name": "anything",
        "path": "/anything",
        "method": "*",
        "responses": [{"status": 200, "share": 1.0, "min_response_ms": 0, "max_response_ms": 0}]
    });
    let (status, _) = request(&app, "POST", "/api/incoming/routes", Some(route)).await;
    assert_eq!(status, StatusCode::CREATED);

    let req = HttpRequest::builder()
        .method("POST")
        .uri("/sim/anything/deep?tag=a&tag=b")
        .header("content-type", "application/json")
        .header("authorization", "Bearer super-secret")
        .body(Body::from(r#"{"payload": 7}"#))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let echo: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(echo["request"]["method"], "POST");
    assert_eq!(echo["request"]["path"], "/anything/deep");
    assert_eq!(echo["request"]["path_suffix"], "/deep");
    assert_eq!(echo["request"]["headers"]["authorization"][0], "[REDACTED]");
    assert_eq!(echo["request"]["query_params"]["tag"][0], "a");
    assert_eq!(echo["request"]["query_params"]["tag"][1], "b");
    assert_eq!(echo["request"]["body"]["payload"], 7);
    assert!(echo["timestamp"].is_string());
}

#[tokio::test]
async fn sim_requests_record_incoming_metrics_and_reset_clears_them() {
    let app = setup_app();

    let (status, _) = request(
        &app,
        "POST",
        "/api/incoming/routes",
        Some(sample_route("ping", "/ping", 200)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    for _ in 0..5 {
        let (status, _) = request(&app, "GET", "/sim/ping", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, snapshot) = request(&app, "GET", "/api/metrics/incoming", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["total_requests"], 5);
    assert_eq!(snapshot["routes"]["ping"]["responses_by_status"]["200"], 5);

    let (status, combined) = request(&app, "GET", "/api/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(combined.get("outgoing").is_some());
    assert!(combined.get("incoming").is_some());
    assert!(combined.get("scheduler").is_some());

    let (status, _) = request(&app, "POST", "/api/metrics/reset", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, snapshot) = request(&app, "GET", "/api/metrics/incoming", None).await;
    assert_eq!(snapshot["total_requests"], 0);
}

#[tokio::test]
async fn incoming_master_switch_gates_the_sim_surface() {
    let app = setup_app();

    let (status, _) = request(
        &app,
        "POST",
        "/api/incoming/routes",
        Some(sample_route("ping", "/ping", 200)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = request(
        &app,
        "PUT",
        "/api/incoming/control",
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&app, "GET", "/sim/ping", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(
        &app,
        "PUT",
        "/api/incoming/control",
        Some(json!({"enabled": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&app, "GET", "/sim/ping", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn reload_rereads_routes_from_the_config_file() {
    let dir = std::env::temp_dir().join(format!("moxapp-reload-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("endpoints.yaml");

    std::fs::write(
        &path,
        r#"
incoming_routes:
  - name: one
    path: /one
    responses:
      - status: 200
        share: 1.0
"#,
    )
    .unwrap();

    let store = Arc::new(ConfigStore::new());
    store.load_from_file(&path).unwrap();
    let app = setup_with_store(Arc::clone(&store));

    let (_, routes) = request(&app, "GET", "/api/incoming/routes", None).await;
    assert_eq!(routes.as_array().unwrap().len(), 1);

    std::fs::write(
        &path,
        r#"
incoming_routes:
  - name: one
    path: /one
    responses:
      - status: 200
        share: 1.0
  - name: two
    path: /two
    responses:
      - status: 503
        share: 1.0
"#,
    )
    .unwrap();

    let (status, body) = request(&app, "POST", "/api/incoming/routes/reload", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["reloaded_routes"], 2);

    let (_, routes) = request(&app, "GET", "/api/incoming/routes", None).await;
    assert_eq!(routes.as_array().unwrap().len(), 2);

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn prometheus_endpoint_renders() {
    let app = setup_app();
    let response = app
        .clone()
        .oneshot(
            HttpRequest::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"), "{content_type}");
}

#[tokio::test]
async fn weighted_route_shares_are_observed_end_to_end() {
    let app = setup_app();

    let route = json!({
        "name": "weighted",
        "path": "/weighted",
        "method": "GET",
        "responses": [
            {"status": 200, "share": 0.9, "min_response_ms": 0, "max_response_ms": 0},
            {"status": 500, "share": 0.1, "min_response_ms": 0, "max_response_ms": 0}
        ]
    });
    let (status, _) = request(&app, "POST", "/api/incoming/routes", Some(route)).await;
    assert_eq!(status, StatusCode::CREATED);

    let mut errors = 0usize;
    const DRAWS: usize = 1000;
    for _ in 0..DRAWS {
        let (status, _) = request(&app, "GET", "/sim/weighted", None).await;
        match status.as_u16() {
            200 => {}
            500 => errors += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    let share = errors as f64 / DRAWS as f64;
    assert!(
        (0.05..=0.16).contains(&share),
        "observed 500-share {share} outside tolerance"
    );

    let (_, snapshot) = request(&app, "GET", "/api/metrics/incoming", None).await;
    let by_status = &snapshot["routes"]["weighted"]["responses_by_status"];
    let total: i64 = by_status["200"].as_i64().unwrap_or(0) + by_status["500"].as_i64().unwrap_or(0);
    assert_eq!(total, DRAWS as i64);
}

#[tokio::test]
async fn endpoint_filter_retains_matching_names() {
    let mut config = TrafficConfig::default();
    for name in ["users-list", "orders-list", "health-probe"] {
        config.endpoints.push(Endpoint {
            name: name.to_string(),
            method: "GET".to_string(),
            url_template: format!("http://localhost/{name}"),
            frequency_per_min: 1.0,
            auth: None,
            headers: HashMap::new(),
            body: None,
            timeout: 30,
            enabled: true,
            resolved_auth: None,
        });
    }
    let store = Arc::new(ConfigStore::with_config(config));
    assert_eq!(store.retain_endpoints("users,orders"), 2);

    let app = setup_with_store(store);
    let (_, list) = request(&app, "GET", "/api/outgoing/endpoints", None).await;
    assert_eq!(list.as_array().unwrap().len(), 2);
}
