//! Configuration entities: outgoing endpoints, incoming routes, auth
//! configs and the top-level traffic configuration.
//!
//! Validation accumulates human-readable messages instead of failing on the
//! first problem; a write is rejected when any message is produced.

use std::collections::HashMap;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const VALID_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Allowed drift when response shares are summed.
pub const SHARE_TOLERANCE: f64 = 0.001;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
    ApiKey,
    ApiKeyQuery,
    Basic,
    CustomHeader,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Bearer => "bearer",
            AuthType::ApiKey => "api_key",
            AuthType::ApiKeyQuery => "api_key_query",
            AuthType::Basic => "basic",
            AuthType::CustomHeader => "custom_header",
        }
    }
}

/// How to obtain and refresh a bearer token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_env: Option<String>,
    /// HTTP method, `POST` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Dotted JSON path to the token in the response, e.g. `access_token`
    /// or `data.token`.
    #[serde(default)]
    pub token_path: String,
    /// Dotted JSON path to the expiry (seconds or epoch timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_path: Option<String>,
}

/// A reusable authentication configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Header carrying the credential (`api_key`, `custom_header`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Query parameter carrying the credential (`api_key_query`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param: Option<String>,
    // Credential sources are env var *names*, never secret values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<TokenEndpoint>,
    /// Seconds before expiry at which proactive refresh starts (60 when 0).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub refresh_before_expiry: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl AuthConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_token_endpoint(&self) -> bool {
        self.token_endpoint.is_some()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let name = &self.name;

        if name.is_empty() {
            errors.push("auth config name is required".to_string());
        }

        let header_required = matches!(self.auth_type, AuthType::ApiKey | AuthType::CustomHeader);
        if header_required {
            if self.header_name.as_deref().unwrap_or("").is_empty() {
                errors.push(format!(
                    "auth {name}: header_name required for type {}",
                    self.auth_type.as_str()
                ));
            }
            if self.env_var.is_none() && self.token_endpoint.is_none() {
                errors.push(format!("auth {name}: env_var or token_endpoint required"));
            }
        }

        match self.auth_type {
            AuthType::ApiKeyQuery => {
                if self.query_param.as_deref().unwrap_or("").is_empty() {
                    errors.push(format!("auth {name}: query_param required for api_key_query"));
                }
                if self.env_var.as_deref().unwrap_or("").is_empty() {
                    errors.push(format!("auth {name}: env_var required for api_key_query"));
                }
            }
            AuthType::Basic => {
                if self.username_env.as_deref().unwrap_or("").is_empty()
                    || self.password_env.as_deref().unwrap_or("").is_empty()
                {
                    errors.push(format!(
                        "auth {name}: username_env and password_env required for basic auth"
                    ));
                }
            }
            AuthType::Bearer => {
                if self.env_var.is_none() && self.token_endpoint.is_none() {
                    errors.push(format!(
                        "auth {name}: env_var or token_endpoint required for bearer"
                    ));
                }
            }
            _ => {}
        }

        // A token endpoint only makes sense for bearer auth.
        if let Some(te) = &self.token_endpoint {
            if self.auth_type != AuthType::Bearer {
                errors.push(format!(
                    "auth {name}: token_endpoint is only valid for bearer auth"
                ));
            }
            if te.url.as_deref().unwrap_or("").is_empty()
                && te.url_env.as_deref().unwrap_or("").is_empty()
            {
                errors.push(format!(
                    "auth {name}: token_endpoint.url or token_endpoint.url_env required"
                ));
            }
            if te.token_path.is_empty() {
                errors.push(format!(
                    "auth {name}: token_endpoint.token_path required (e.g. 'access_token' or 'data.token')"
                ));
            }
        }

        errors
    }
}

/// An endpoint's `auth` field: either a named reference or an inline
/// descriptor (possibly a reference with shallow overrides).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthRef {
    Name(String),
    Inline(InlineAuth),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InlineAuth {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

/// Resolve an endpoint's auth field to a fully-populated snapshot.
pub fn resolve_auth(
    auth: Option<&AuthRef>,
    configs: &HashMap<String, AuthConfig>,
) -> anyhow::Result<AuthConfig> {
    match auth {
        None => Ok(AuthConfig::none()),
        Some(AuthRef::Name(name)) => {
            if name.is_empty() || name == "none" {
                return Ok(AuthConfig::none());
            }
            configs
                .get(name)
                .cloned()
                .with_context(|| format!("auth config not found: {name}"))
        }
        Some(AuthRef::Inline(inline)) => {
            if let Some(ref_name) = inline.ref_name.as_deref() {
                let mut resolved = configs
                    .get(ref_name)
                    .cloned()
                    .with_context(|| format!("auth config not found: {ref_name}"))?;
                if let Some(header_name) = &inline.header_name {
                    resolved.header_name = Some(header_name.clone());
                }
                if let Some(query_param) = &inline.query_param {
                    resolved.query_param = Some(query_param.clone());
                }
                return Ok(resolved);
            }

            let auth_type = inline
                .auth_type
                .context("inline auth config missing required field: type")?;
            Ok(AuthConfig {
                auth_type,
                header_name: inline.header_name.clone(),
                query_param: inline.query_param.clone(),
                env_var: inline.env_var.clone(),
                username_env: inline.username_env.clone(),
                password_env: inline.password_env.clone(),
                ..AuthConfig::default()
            })
        }
    }
}

/// Does `auth` reference the named auth config (directly or via `ref`)?
pub fn references_auth(auth: Option<&AuthRef>, name: &str) -> bool {
    match auth {
        Some(AuthRef::Name(n)) => n == name,
        Some(AuthRef::Inline(inline)) => inline.ref_name.as_deref() == Some(name),
        None => false,
    }
}

/// Walk a dotted path (`data.token`) through nested JSON objects.
pub fn extract_json_path(data: &serde_json::Value, path: &str) -> anyhow::Result<serde_json::Value> {
    if path.is_empty() {
        bail!("json path is empty");
    }

    let mut current = data;
    for (i, part) in path.split('.').enumerate() {
        let object = current.as_object().with_context(|| {
            format!(
                "expected object at path segment '{}'",
                path.split('.').take(i).collect::<Vec<_>>().join(".")
            )
        })?;
        current = object
            .get(part)
            .with_context(|| format!("path segment '{part}' not found"))?;
    }
    Ok(current.clone())
}

/// A single outgoing endpoint under load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub url_template: String,
    /// Requests per minute before the global multiplier.
    #[serde(rename = "frequency", default)]
    pub frequency_per_min: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthRef>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Snapshot resolved from `auth` on every write; never serialized.
    #[serde(skip)]
    pub resolved_auth: Option<AuthConfig>,
}

impl Endpoint {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let name = &self.name;

        if name.is_empty() {
            errors.push("name is required".to_string());
        }
        if self.method.is_empty() {
            errors.push(format!("endpoint {name}: method is required"));
        } else if !VALID_METHODS.contains(&self.method.as_str()) {
            errors.push(format!("endpoint {name}: invalid method {}", self.method));
        }
        if self.url_template.is_empty() {
            errors.push(format!("endpoint {name}: url_template is required"));
        }
        if self.frequency_per_min < 0.0 {
            errors.push(format!("endpoint {name}: frequency must be non-negative"));
        }
        if self.timeout == 0 {
            errors.push(format!("endpoint {name}: timeout must be positive"));
        }

        errors
    }
}

/// A weighted response choice for an incoming route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(rename = "status")]
    pub status: u16,
    pub share: f64,
    #[serde(default)]
    pub min_response_ms: u64,
    #[serde(default)]
    pub max_response_ms: u64,
}

impl ResponseSpec {
    pub fn validate(&self, route: &str, index: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if !(100..=599).contains(&self.status) {
            errors.push(format!(
                "route {route} response[{index}]: status code must be between 100 and 599"
            ));
        }
        if !(0.0..=1.0).contains(&self.share) {
            errors.push(format!(
                "route {route} response[{index}]: share must be between 0 and 1"
            ));
        }
        if self.max_response_ms < self.min_response_ms {
            errors.push(format!(
                "route {route} response[{index}]: max_response_ms must be >= min_response_ms"
            ));
        }

        errors
    }
}

/// A simulated inbound route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingRoute {
    pub name: String,
    #[serde(default)]
    pub path: String,
    /// HTTP verb or `*` for any method.
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub responses: Vec<ResponseSpec>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl IncomingRoute {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let name = &self.name;

        if name.is_empty() {
            errors.push("name is required".to_string());
        }
        if self.path.is_empty() {
            errors.push(format!("route {name}: path is required"));
        } else if !self.path.starts_with('/') {
            errors.push(format!("route {name}: path must start with /"));
        }
        if self.method.is_empty() {
            errors.push(format!("route {name}: method is required"));
        } else if self.method != "*" && !VALID_METHODS.contains(&self.method.as_str()) {
            errors.push(format!(
                "route {name}: invalid method {} (use * for any method)",
                self.method
            ));
        }
        if self.responses.is_empty() {
            errors.push(format!(
                "route {name}: at least one response configuration is required"
            ));
        }

        let mut total_share = 0.0;
        for (i, response) in self.responses.iter().enumerate() {
            errors.extend(response.validate(name, i));
            total_share += response.share;
        }
        if !self.responses.is_empty() && (total_share - 1.0).abs() > SHARE_TOLERANCE {
            errors.push(format!(
                "route {name}: response shares must sum to 1.0 (got {total_share:.3})"
            ));
        }

        errors
    }
}

/// The whole in-memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Master switch for outgoing scheduling.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_multiplier")]
    pub global_multiplier: f64,
    #[serde(default = "default_concurrent")]
    pub concurrent_requests: usize,
    #[serde(default)]
    pub log_all_requests: bool,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_true")]
    pub incoming_enabled: bool,
    #[serde(default)]
    pub auth_configs: HashMap<String, AuthConfig>,
    #[serde(rename = "outgoing_endpoints", default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(rename = "incoming_routes", default)]
    pub incoming_routes: Vec<IncomingRoute>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_multiplier: 1.0,
            concurrent_requests: default_concurrent(),
            log_all_requests: false,
            api_port: default_api_port(),
            incoming_enabled: true,
            auth_configs: HashMap::new(),
            endpoints: Vec::new(),
            incoming_routes: Vec::new(),
        }
    }
}

impl TrafficConfig {
    /// Apply defaults and resolve endpoint auth. Idempotent.
    ///
    /// Auth resolution failures fall back to `none` with a warning; callers
    /// that must treat them as hard errors (the management API) resolve
    /// again before committing.
    pub fn normalize(&mut self) {
        for (name, auth) in &mut self.auth_configs {
            auth.name = name.clone();
        }
        if self.global_multiplier == 0.0 {
            self.global_multiplier = 1.0;
        }
        if self.concurrent_requests == 0 {
            self.concurrent_requests = default_concurrent();
        }
        if self.api_port == 0 {
            self.api_port = default_api_port();
        }

        for endpoint in &mut self.endpoints {
            normalize_endpoint(endpoint);
            match resolve_auth(endpoint.auth.as_ref(), &self.auth_configs) {
                Ok(resolved) => endpoint.resolved_auth = Some(resolved),
                Err(err) => {
                    warn!(endpoint = %endpoint.name, %err, "failed to resolve auth; falling back to none");
                    endpoint.resolved_auth = Some(AuthConfig::none());
                }
            }
        }

        for route in &mut self.incoming_routes {
            if route.method.is_empty() {
                route.method = default_method();
            }
        }
    }

    /// Accumulate validation messages across the whole configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.global_multiplier < 0.0 {
            errors.push("global_multiplier must be non-negative".to_string());
        }
        if self.concurrent_requests == 0 {
            errors.push("concurrent_requests must be positive".to_string());
        }

        for auth in self.auth_configs.values() {
            errors.extend(auth.validate());
        }

        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.name.clone()) {
                errors.push(format!("duplicate endpoint name: {}", endpoint.name));
            }
            errors.extend(endpoint.validate());
        }

        let mut seen_routes = std::collections::HashSet::new();
        for route in &self.incoming_routes {
            if !seen_routes.insert(route.name.clone()) {
                errors.push(format!("duplicate route name: {}", route.name));
            }
            errors.extend(route.validate());
        }

        errors
    }

    pub fn total_base_requests_per_min(&self) -> f64 {
        self.endpoints.iter().map(|e| e.frequency_per_min).sum()
    }

    pub fn adjusted_requests_per_min(&self) -> f64 {
        self.total_base_requests_per_min() * self.global_multiplier
    }
}

pub(crate) fn normalize_endpoint(endpoint: &mut Endpoint) {
    if endpoint.timeout == 0 {
        endpoint.timeout = DEFAULT_TIMEOUT_SECS;
    }
    if endpoint.method.is_empty() {
        endpoint.method = default_method();
    }
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_concurrent() -> usize {
    30
}

fn default_api_port() -> u16 {
    8080
}
