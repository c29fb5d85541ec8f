//! Instrumented HTTP client: one `execute` per endpoint attempt, with
//! template expansion, auth application, per-phase timing capture and a
//! single classified `RequestResult` out.

mod auth;
mod token;
mod trace;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use auth::apply_auth;
pub use token::{ManagedToken, TokenManager, TokenStatus};
pub use trace::{
    bounded, classify_error_text, classify_reqwest_error, extract_hostname, probe_phases,
    ErrorKind, Interrupted, PhaseTimings,
};

use crate::config::Endpoint;
use crate::envfile::EnvSource;
use crate::template;

/// The outcome of a single outgoing request attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub endpoint_name: String,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "error_type", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub total_time_ms: f64,
    pub dns_time_ms: f64,
    pub connect_time_ms: f64,
    pub tls_time_ms: f64,
    pub time_to_first_byte_ms: f64,
    pub hostname: String,
    pub response_size: u64,
    pub request_timestamp: DateTime<Utc>,
}

impl RequestResult {
    fn start(endpoint: &Endpoint) -> Self {
        Self {
            endpoint_name: endpoint.name.clone(),
            url: String::new(),
            method: endpoint.method.clone(),
            status_code: 0,
            success: false,
            error: None,
            error_kind: None,
            total_time_ms: 0.0,
            dns_time_ms: 0.0,
            connect_time_ms: 0.0,
            tls_time_ms: 0.0,
            time_to_first_byte_ms: 0.0,
            hostname: String::new(),
            response_size: 0,
            request_timestamp: Utc::now(),
        }
    }

    fn apply_timings(&mut self, timings: &PhaseTimings) {
        self.dns_time_ms = timings.dns_ms;
        self.connect_time_ms = timings.connect_ms;
        self.tls_time_ms = timings.tls_ms;
    }
}

/// Executes one endpoint attempt. The scheduler depends on this trait so
/// tests can substitute a mock executor.
pub trait RequestExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        deadline: Duration,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = RequestResult> + Send + 'a>>;
}

#[derive(Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub max_conns: usize,
    pub env: EnvSource,
}

impl ClientOptions {
    pub fn new(env: EnvSource) -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_conns: 100,
            env,
        }
    }
}

pub struct HttpClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    env: EnvSource,
}

impl HttpClient {
    pub fn new(options: ClientOptions, tokens: Arc<TokenManager>) -> anyhow::Result<Self> {
        // One shared transport: idle pool capped, keep-alives on, HTTP/2
        // attempted, redirects never followed.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(options.max_conns.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(crate::USER_AGENT)
            .timeout(options.timeout)
            .build()?;

        Ok(Self {
            http,
            tokens,
            env: options.env,
        })
    }

    /// Execute a single attempt against `endpoint`.
    ///
    /// Every await point observes both `deadline` and `cancel`; an
    /// interruption yields a `timeout`/`cancelled` result that keeps the
    /// phase timings captured so far.
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> RequestResult {
        let started = Instant::now();
        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut result = RequestResult::start(endpoint);
        let timings = PhaseTimings::default();

        let url = match template::evaluate(&endpoint.url_template, self.env.vars()) {
            Ok(url) => url,
            Err(err) => {
                return fail(
                    result,
                    started,
                    &timings,
                    ErrorKind::Template,
                    format!("template error: {err}"),
                )
            }
        };
        result.url = url.clone();
        result.hostname = extract_hostname(&url);

        let mut body_bytes = None;
        if matches!(endpoint.method.as_str(), "POST" | "PUT" | "PATCH") {
            if let Some(body) = &endpoint.body {
                let evaluated = match template::evaluate_body(body, self.env.vars()) {
                    Ok(value) => value,
                    Err(err) => {
                        return fail(
                            result,
                            started,
                            &timings,
                            ErrorKind::Template,
                            format!("body template error: {err}"),
                        )
                    }
                };
                match serde_json::to_vec(&evaluated) {
                    Ok(bytes) => body_bytes = Some(bytes),
                    Err(err) => {
                        return fail(
                            result,
                            started,
                            &timings,
                            ErrorKind::Marshal,
                            format!("body marshal error: {err}"),
                        )
                    }
                }
            }
        }

        let parsed = match url::Url::parse(&url) {
            Ok(parsed) => parsed,
            Err(err) => {
                return fail(
                    result,
                    started,
                    &timings,
                    ErrorKind::Request,
                    format!("invalid url {url:?}: {err}"),
                )
            }
        };
        let method = match reqwest::Method::from_bytes(endpoint.method.as_bytes()) {
            Ok(method) => method,
            Err(err) => {
                return fail(
                    result,
                    started,
                    &timings,
                    ErrorKind::Request,
                    format!("invalid method {:?}: {err}", endpoint.method),
                )
            }
        };

        // Phase capture: own the dial path once, then run the request on
        // the shared pool.
        let mut timings = timings;
        if let Err((kind, message)) =
            probe_phases(&parsed, &mut timings, deadline_at, cancel).await
        {
            return fail(result, started, &timings, kind, message);
        }

        let remaining = deadline
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(1));
        let mut request = self.http.request(method, parsed).timeout(remaining);

        // Header values are themselves templates; the raw string is used
        // when expansion fails.
        for (key, value) in &endpoint.headers {
            let evaluated =
                template::evaluate(value, self.env.vars()).unwrap_or_else(|_| value.clone());
            request = request.header(key, evaluated);
        }
        if let Some(bytes) = body_bytes {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes);
        }

        if let Some(resolved) = &endpoint.resolved_auth {
            match bounded(
                apply_auth(request, resolved, &self.tokens, &self.env),
                deadline_at,
                cancel,
            )
            .await
            {
                Ok(Ok(with_auth)) => request = with_auth,
                Ok(Err(err)) => {
                    return fail(
                        result,
                        started,
                        &timings,
                        ErrorKind::Auth,
                        format!("auth error: {err}"),
                    )
                }
                Err(interrupt) => {
                    return fail(
                        result,
                        started,
                        &timings,
                        interrupt.kind(),
                        interrupt.message().to_string(),
                    )
                }
            }
        }

        let send_started = Instant::now();
        let mut response = match bounded(request.send(), deadline_at, cancel).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let (kind, message) = classify_reqwest_error(&err);
                return fail(result, started, &timings, kind, message);
            }
            Err(interrupt) => {
                return fail(
                    result,
                    started,
                    &timings,
                    interrupt.kind(),
                    interrupt.message().to_string(),
                )
            }
        };
        result.time_to_first_byte_ms = elapsed_ms(send_started);
        result.status_code = response.status().as_u16();

        // Drain and discard the body so the connection can be reused.
        loop {
            match bounded(response.chunk(), deadline_at, cancel).await {
                Ok(Ok(Some(chunk))) => result.response_size += chunk.len() as u64,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    let (kind, message) = classify_reqwest_error(&err);
                    return fail(result, started, &timings, kind, message);
                }
                Err(interrupt) => {
                    return fail(
                        result,
                        started,
                        &timings,
                        interrupt.kind(),
                        interrupt.message().to_string(),
                    )
                }
            }
        }

        result.apply_timings(&timings);
        result.total_time_ms = elapsed_ms(started);
        result.success = (200..400).contains(&result.status_code);
        if !result.success {
            result.error_kind = Some(ErrorKind::Http);
            result.error = Some(format!("HTTP {}", result.status_code));
        }
        result
    }
}

impl RequestExecutor for HttpClient {
    fn execute<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        deadline: Duration,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = RequestResult> + Send + 'a>> {
        Box::pin(self.execute(endpoint, deadline, cancel))
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_micros() as f64 / 1000.0
}

fn fail(
    mut result: RequestResult,
    started: Instant,
    timings: &PhaseTimings,
    kind: ErrorKind,
    message: String,
) -> RequestResult {
    result.apply_timings(timings);
    result.total_time_ms = elapsed_ms(started);
    result.error_kind = Some(kind);
    result.error = Some(message);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthType};
    use httpmock::prelude::*;
    use std::collections::HashMap;

    fn endpoint(name: &str, method: &str, url: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            method: method.to_string(),
            url_template: url.to_string(),
            frequency_per_min: 60.0,
            auth: None,
            headers: HashMap::new(),
            body: None,
            timeout: 30,
            enabled: true,
            resolved_auth: None,
        }
    }

    fn client_with_env(env: EnvSource) -> HttpClient {
        let tokens = Arc::new(
            TokenManager::new(HashMap::new(), env.clone()).expect("token manager builds"),
        );
        HttpClient::new(ClientOptions::new(env), tokens).expect("client builds")
    }

    fn client() -> HttpClient {
        client_with_env(EnvSource::default())
    }

    fn far() -> Duration {
        Duration::from_secs(10)
    }

    #[tokio::test]
    async fn successful_request_captures_timing_and_size() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/users");
            then.status(200).body("hello");
        });

        let cancel = CancellationToken::new();
        let result = client()
            .execute(&endpoint("users", "GET", &server.url("/users")), far(), &cancel)
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.response_size, 5);
        assert!(result.total_time_ms > 0.0);
        assert!(result.time_to_first_byte_ms > 0.0);
        assert!(result.connect_time_ms > 0.0);
        assert_eq!(result.hostname, "127.0.0.1");
        assert!(result.error_kind.is_none());
    }

    #[tokio::test]
    async fn non_2xx_statuses_classify_as_http_errors() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/boom");
            then.status(503);
        });

        let cancel = CancellationToken::new();
        let result = client()
            .execute(&endpoint("boom", "GET", &server.url("/boom")), far(), &cancel)
            .await;

        assert!(!result.success);
        assert_eq!(result.status_code, 503);
        assert_eq!(result.error_kind, Some(ErrorKind::Http));
        assert_eq!(result.error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/moved");
            then.status(302).header("location", "http://example.invalid/");
        });

        let cancel = CancellationToken::new();
        let result = client()
            .execute(&endpoint("moved", "GET", &server.url("/moved")), far(), &cancel)
            .await;

        // 3xx is a success under the 200..400 rule; the redirect target is
        // never fetched.
        assert!(result.success);
        assert_eq!(result.status_code, 302);
    }

    #[tokio::test]
    async fn template_errors_short_circuit_with_zero_phase_times() {
        let cancel = CancellationToken::new();
        let result = client()
            .execute(
                &endpoint("bad", "GET", "http://localhost/{{bogus}}"),
                far(),
                &cancel,
            )
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Template));
        assert_eq!(result.dns_time_ms, 0.0);
        assert_eq!(result.connect_time_ms, 0.0);
        assert_eq!(result.status_code, 0);
    }

    #[tokio::test]
    async fn connection_refused_classifies_as_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let result = client()
            .execute(
                &endpoint("refused", "GET", &format!("http://{addr}/")),
                far(),
                &cancel,
            )
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Connection), "{:?}", result.error);
    }

    #[tokio::test]
    async fn slow_responses_hit_the_deadline() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(5));
        });

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let result = client()
            .execute(
                &endpoint("slow", "GET", &server.url("/slow")),
                Duration::from_millis(250),
                &cancel,
            )
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout), "{:?}", result.error);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_request() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/hang");
            then.status(200).delay(Duration::from_secs(5));
        });

        let cancel = CancellationToken::new();
        let client = client();
        let ep = endpoint("hang", "GET", &server.url("/hang"));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = client.execute(&ep, far(), &cancel).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn header_values_are_template_expanded_with_raw_fallback() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/headers")
                .header("x-host", "api.example.com")
                .header("x-raw", "{{bogus}}");
            then.status(204);
        });

        let env = EnvSource::from_map(HashMap::from([(
            "API_HOST".to_string(),
            "api.example.com".to_string(),
        )]));
        let mut ep = endpoint("headers", "GET", &server.url("/headers"));
        ep.headers = HashMap::from([
            ("x-host".to_string(), "{{env \"API_HOST\"}}".to_string()),
            ("x-raw".to_string(), "{{bogus}}".to_string()),
        ]);

        let cancel = CancellationToken::new();
        let result = client_with_env(env).execute(&ep, far(), &cancel).await;
        assert!(result.success, "error: {:?}", result.error);
        mock.assert();
    }

    #[tokio::test]
    async fn post_bodies_are_expanded_and_sent_as_json() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/items")
                .header("content-type", "application/json")
                .json_body_partial(r#"{"kind": "widget"}"#);
            then.status(201);
        });

        let mut ep = endpoint("items", "POST", &server.url("/items"));
        ep.body = Some(serde_json::json!({
            "kind": "widget",
            "ref": "{{randomString 6}}",
        }));

        let cancel = CancellationToken::new();
        let result = client().execute(&ep, far(), &cancel).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.status_code, 201);
        mock.assert();
    }

    #[tokio::test]
    async fn resolved_auth_is_applied_to_the_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/secure")
                .header("authorization", "Bearer static-secret");
            then.status(200);
        });

        let env = EnvSource::from_map(HashMap::from([(
            "API_TOKEN".to_string(),
            "static-secret".to_string(),
        )]));
        let auth = AuthConfig {
            name: "svc".to_string(),
            auth_type: AuthType::Bearer,
            env_var: Some("API_TOKEN".to_string()),
            ..AuthConfig::default()
        };
        let tokens = Arc::new(
            TokenManager::new(HashMap::from([("svc".to_string(), auth.clone())]), env.clone())
                .unwrap(),
        );
        let client = HttpClient::new(ClientOptions::new(env), tokens).unwrap();

        let mut ep = endpoint("secure", "GET", &server.url("/secure"));
        ep.resolved_auth = Some(auth);

        let cancel = CancellationToken::new();
        let result = client.execute(&ep, far(), &cancel).await;
        assert!(result.success, "error: {:?}", result.error);
        mock.assert();
    }
}
