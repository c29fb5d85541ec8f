//! Thread-safe configuration store.
//!
//! A single reader/writer lock guards the whole configuration. Reads clone
//! so callers never iterate under the lock; writers validate a candidate
//! and only commit when no error message is produced.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::file::read_config_file;
use super::model::{
    normalize_endpoint, references_auth, resolve_auth, AuthConfig, Endpoint, IncomingRoute,
    TrafficConfig,
};

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    Validation(Vec<String>),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(msg) | StoreError::Conflict(msg) => f.write_str(msg),
            StoreError::Validation(errors) => {
                write!(f, "validation failed: {}", errors.join("; "))
            }
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Default)]
pub struct ConfigStore {
    inner: RwLock<TrafficConfig>,
    config_path: RwLock<Option<PathBuf>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut config: TrafficConfig) -> Self {
        config.normalize();
        Self {
            inner: RwLock::new(config),
            config_path: RwLock::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrafficConfig> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrafficConfig> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // --- loading -------------------------------------------------------

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut config = read_config_file(path.as_ref())?;
        config.normalize();
        *self.write() = config;
        *self
            .config_path
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(path.as_ref().to_path_buf());
        Ok(())
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_path
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the configured YAML path and swap in its incoming routes.
    /// Returns the number of routes now active.
    pub fn reload_incoming_routes(&self) -> anyhow::Result<usize> {
        let path = self
            .config_path()
            .ok_or_else(|| anyhow::anyhow!("no configuration file path recorded"))?;
        let mut fresh = read_config_file(&path)?;
        fresh.normalize();

        let mut errors = Vec::new();
        for route in &fresh.incoming_routes {
            errors.extend(route.validate());
        }
        if !errors.is_empty() {
            anyhow::bail!("route validation failed: {}", errors.join("; "));
        }

        let mut guard = self.write();
        guard.incoming_routes = fresh.incoming_routes;
        Ok(guard.incoming_routes.len())
    }

    /// Validate a candidate and atomically swap the whole configuration.
    pub fn replace_all(&self, mut candidate: TrafficConfig) -> StoreResult<()> {
        candidate.normalize();
        let errors = candidate.validate();
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        *self.write() = candidate;
        Ok(())
    }

    pub fn snapshot(&self) -> TrafficConfig {
        self.read().clone()
    }

    pub fn validate(&self) -> Vec<String> {
        self.read().validate()
    }

    // --- global settings ----------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.read().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.write().enabled = enabled;
    }

    pub fn is_incoming_enabled(&self) -> bool {
        self.read().incoming_enabled
    }

    pub fn set_incoming_enabled(&self, enabled: bool) {
        self.write().incoming_enabled = enabled;
    }

    pub fn set_global_multiplier(&self, multiplier: f64) {
        self.write().global_multiplier = multiplier;
    }

    pub fn set_concurrent_requests(&self, concurrent: usize) {
        self.write().concurrent_requests = concurrent;
    }

    pub fn set_log_all_requests(&self, log: bool) {
        self.write().log_all_requests = log;
    }

    pub fn log_all_requests(&self) -> bool {
        self.read().log_all_requests
    }

    pub fn set_api_port(&self, port: u16) {
        self.write().api_port = port;
    }

    pub fn total_base_requests_per_min(&self) -> f64 {
        self.read().total_base_requests_per_min()
    }

    pub fn adjusted_requests_per_min(&self) -> f64 {
        self.read().adjusted_requests_per_min()
    }

    // --- endpoints -----------------------------------------------------

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.read().endpoints.clone()
    }

    pub fn endpoint(&self, name: &str) -> Option<Endpoint> {
        self.read().endpoints.iter().find(|e| e.name == name).cloned()
    }

    pub fn endpoint_enabled(&self, name: &str) -> Option<bool> {
        self.read()
            .endpoints
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.enabled)
    }

    pub fn add_endpoint(&self, mut endpoint: Endpoint) -> StoreResult<()> {
        let mut guard = self.write();
        if guard.endpoints.iter().any(|e| e.name == endpoint.name) {
            return Err(StoreError::Conflict(format!(
                "endpoint already exists: {}",
                endpoint.name
            )));
        }
        prepare_endpoint(&mut endpoint, &guard.auth_configs)?;
        guard.endpoints.push(endpoint);
        Ok(())
    }

    pub fn update_endpoint(&self, name: &str, mut endpoint: Endpoint) -> StoreResult<()> {
        let mut guard = self.write();
        let Some(index) = guard.endpoints.iter().position(|e| e.name == name) else {
            return Err(StoreError::NotFound(format!("endpoint not found: {name}")));
        };
        if endpoint.name != name
            && guard.endpoints.iter().any(|e| e.name == endpoint.name)
        {
            return Err(StoreError::Conflict(format!(
                "endpoint with name {} already exists",
                endpoint.name
            )));
        }
        prepare_endpoint(&mut endpoint, &guard.auth_configs)?;
        guard.endpoints[index] = endpoint;
        Ok(())
    }

    pub fn delete_endpoint(&self, name: &str) -> StoreResult<()> {
        let mut guard = self.write();
        let before = guard.endpoints.len();
        guard.endpoints.retain(|e| e.name != name);
        if guard.endpoints.len() == before {
            return Err(StoreError::NotFound(format!("endpoint not found: {name}")));
        }
        Ok(())
    }

    pub fn set_endpoint_enabled(&self, name: &str, enabled: bool) -> StoreResult<()> {
        let mut guard = self.write();
        match guard.endpoints.iter_mut().find(|e| e.name == name) {
            Some(endpoint) => {
                endpoint.enabled = enabled;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("endpoint not found: {name}"))),
        }
    }

    /// Keep only endpoints whose name contains one of the comma-separated
    /// substrings (case-insensitive). Returns how many remain.
    pub fn retain_endpoints(&self, filter: &str) -> usize {
        let patterns: Vec<String> = filter
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return self.read().endpoints.len();
        }

        let mut guard = self.write();
        guard.endpoints.retain(|endpoint| {
            let name = endpoint.name.to_lowercase();
            patterns.iter().any(|p| name.contains(p))
        });
        guard.endpoints.len()
    }

    // --- auth configs --------------------------------------------------

    pub fn auth_configs(&self) -> HashMap<String, AuthConfig> {
        self.read().auth_configs.clone()
    }

    pub fn auth_config(&self, name: &str) -> Option<AuthConfig> {
        self.read().auth_configs.get(name).cloned()
    }

    pub fn add_auth_config(&self, mut auth: AuthConfig) -> StoreResult<()> {
        if auth.name.is_empty() {
            return Err(StoreError::Validation(vec![
                "auth config name is required".to_string(),
            ]));
        }
        let mut guard = self.write();
        if guard.auth_configs.contains_key(&auth.name) {
            return Err(StoreError::Conflict(format!(
                "auth config already exists: {}",
                auth.name
            )));
        }
        let errors = auth.validate();
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        let name = auth.name.clone();
        auth.name = name.clone();
        guard.auth_configs.insert(name, auth);
        reresolve_endpoints(&mut guard);
        Ok(())
    }

    pub fn update_auth_config(&self, name: &str, auth: AuthConfig) -> StoreResult<()> {
        let mut guard = self.write();
        if !guard.auth_configs.contains_key(name) {
            return Err(StoreError::NotFound(format!(
                "auth config not found: {name}"
            )));
        }
        if auth.name != name && guard.auth_configs.contains_key(&auth.name) {
            return Err(StoreError::Conflict(format!(
                "auth config with name {} already exists",
                auth.name
            )));
        }
        let errors = auth.validate();
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        if auth.name != name {
            guard.auth_configs.remove(name);
        }
        guard.auth_configs.insert(auth.name.clone(), auth);
        reresolve_endpoints(&mut guard);
        Ok(())
    }

    pub fn delete_auth_config(&self, name: &str) -> StoreResult<()> {
        let mut guard = self.write();
        if !guard.auth_configs.contains_key(name) {
            return Err(StoreError::NotFound(format!(
                "auth config not found: {name}"
            )));
        }
        if let Some(user) = guard
            .endpoints
            .iter()
            .find(|e| references_auth(e.auth.as_ref(), name))
        {
            return Err(StoreError::Conflict(format!(
                "cannot delete auth config {name}: used by endpoint {}",
                user.name
            )));
        }
        guard.auth_configs.remove(name);
        Ok(())
    }

    // --- incoming routes ----------------------------------------------

    pub fn incoming_routes(&self) -> Vec<IncomingRoute> {
        self.read().incoming_routes.clone()
    }

    pub fn incoming_route(&self, name: &str) -> Option<IncomingRoute> {
        self.read()
            .incoming_routes
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn add_incoming_route(&self, mut route: IncomingRoute) -> StoreResult<()> {
        let mut guard = self.write();
        if guard.incoming_routes.iter().any(|r| r.name == route.name) {
            return Err(StoreError::Conflict(format!(
                "incoming route already exists: {}",
                route.name
            )));
        }
        if route.method.is_empty() {
            route.method = "GET".to_string();
        }
        let errors = route.validate();
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        guard.incoming_routes.push(route);
        Ok(())
    }

    pub fn update_incoming_route(&self, name: &str, mut route: IncomingRoute) -> StoreResult<()> {
        let mut guard = self.write();
        let Some(index) = guard.incoming_routes.iter().position(|r| r.name == name) else {
            return Err(StoreError::NotFound(format!(
                "incoming route not found: {name}"
            )));
        };
        if route.name != name
            && guard.incoming_routes.iter().any(|r| r.name == route.name)
        {
            return Err(StoreError::Conflict(format!(
                "incoming route with name {} already exists",
                route.name
            )));
        }
        if route.method.is_empty() {
            route.method = "GET".to_string();
        }
        let errors = route.validate();
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        guard.incoming_routes[index] = route;
        Ok(())
    }

    pub fn delete_incoming_route(&self, name: &str) -> StoreResult<()> {
        let mut guard = self.write();
        let before = guard.incoming_routes.len();
        guard.incoming_routes.retain(|r| r.name != name);
        if guard.incoming_routes.len() == before {
            return Err(StoreError::NotFound(format!(
                "incoming route not found: {name}"
            )));
        }
        Ok(())
    }

    pub fn set_incoming_route_enabled(&self, name: &str, enabled: bool) -> StoreResult<()> {
        let mut guard = self.write();
        match guard.incoming_routes.iter_mut().find(|r| r.name == name) {
            Some(route) => {
                route.enabled = enabled;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "incoming route not found: {name}"
            ))),
        }
    }

    /// Find the best-matching enabled route for `path` + `method`.
    ///
    /// Routes are tried longest path first. A route matches when the method
    /// is `*` or equal, the path is a prefix, and the remainder is empty or
    /// starts with `/`. Returns the route and the path suffix.
    pub fn match_incoming_route(&self, path: &str, method: &str) -> Option<(IncomingRoute, String)> {
        let guard = self.read();
        if !guard.incoming_enabled {
            return None;
        }

        let mut sorted: Vec<&IncomingRoute> = guard.incoming_routes.iter().collect();
        sorted.sort_by(|a, b| b.path.len().cmp(&a.path.len()));

        for route in sorted {
            if !route.enabled {
                continue;
            }
            if route.method != "*" && route.method != method {
                continue;
            }
            if let Some(suffix) = path.strip_prefix(route.path.as_str()) {
                if suffix.is_empty() || suffix.starts_with('/') {
                    return Some((route.clone(), suffix.to_string()));
                }
            }
        }
        None
    }
}

fn prepare_endpoint(
    endpoint: &mut Endpoint,
    auth_configs: &HashMap<String, AuthConfig>,
) -> StoreResult<()> {
    normalize_endpoint(endpoint);
    // Unresolvable auth is a hard error on API writes (load-time resolution
    // falls back to none instead).
    match resolve_auth(endpoint.auth.as_ref(), auth_configs) {
        Ok(resolved) => endpoint.resolved_auth = Some(resolved),
        Err(err) => {
            return Err(StoreError::Validation(vec![format!(
                "failed to resolve auth: {err}"
            )]))
        }
    }
    let errors = endpoint.validate();
    if !errors.is_empty() {
        return Err(StoreError::Validation(errors));
    }
    Ok(())
}

fn reresolve_endpoints(config: &mut TrafficConfig) {
    for endpoint in &mut config.endpoints {
        match resolve_auth(endpoint.auth.as_ref(), &config.auth_configs) {
            Ok(resolved) => endpoint.resolved_auth = Some(resolved),
            Err(_) => endpoint.resolved_auth = Some(AuthConfig::none()),
        }
    }
}
