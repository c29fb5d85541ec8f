use std::{collections::HashMap, path::Path, sync::Arc};

use tracing::debug;

/// Environment lookup shared by the template evaluator, the auth applicator
/// and the token manager.
///
/// Values come from a dotenv-style file merged under the process
/// environment (process variables win). Keys are normalized to uppercase;
/// lookups are case-insensitive. Missing keys read as the empty string.
#[derive(Clone, Default)]
pub struct EnvSource {
    vars: Arc<HashMap<String, String>>,
}

impl EnvSource {
    /// Load variables from `path` (ignored when absent) plus the process
    /// environment.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let mut vars = HashMap::new();

        if let Ok(contents) = std::fs::read_to_string(path.as_ref()) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let key = key.trim().to_uppercase();
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                    .unwrap_or(value);
                vars.insert(key, value.to_string());
            }
            debug!(path = %path.as_ref().display(), count = vars.len(), "loaded env file");
        }

        for (key, value) in std::env::vars() {
            vars.insert(key.to_uppercase(), value);
        }

        Self {
            vars: Arc::new(vars),
        }
    }

    /// Build an env source from a fixed map (tests and embedders).
    pub fn from_map(map: HashMap<String, String>) -> Self {
        let vars = map
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        Self {
            vars: Arc::new(vars),
        }
    }

    /// `GetEnv` contract: empty string when the key is absent.
    pub fn get(&self, key: &str) -> String {
        self.vars
            .get(&key.to_uppercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// The reserved `API_PORT` override, when present and valid.
    pub fn api_port(&self) -> Option<u16> {
        let raw = self.get("API_PORT");
        if raw.is_empty() {
            return None;
        }
        raw.parse().ok()
    }
}
