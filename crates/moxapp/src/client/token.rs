//! Token acquisition and background refresh for bearer auth configs.
//!
//! Tokens are cached per auth-config name. A refresh makes up to four
//! attempts with increasing delays; when every attempt fails and a prior
//! token exists, the stale token keeps being served and the failure is
//! only recorded (`last_error`, `error_count`).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, RwLock},
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::{extract_json_path, AuthConfig};
use crate::envfile::EnvSource;
use crate::telemetry;
use crate::template;

const DEFAULT_REFRESH_BEFORE_EXPIRY: i64 = 60;
const BACKGROUND_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ManagedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_at: DateTime<Utc>,
    pub last_refresh: DateTime<Utc>,
    pub last_error: Option<String>,
    pub error_count: u32,
}

/// Introspection view of a token's lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub has_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub error_count: u32,
    pub is_expired: bool,
    pub needs_refresh: bool,
}

pub struct TokenManager {
    tokens: Mutex<HashMap<String, ManagedToken>>,
    auth_configs: RwLock<HashMap<String, AuthConfig>>,
    http: reqwest::Client,
    env: EnvSource,
    retry_delays: Vec<Duration>,
    refresh_interval: Duration,
    background: StdMutex<Option<watch::Sender<bool>>>,
}

impl TokenManager {
    pub fn new(auth_configs: HashMap<String, AuthConfig>, env: EnvSource) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build token http client")?;

        Ok(Self {
            tokens: Mutex::new(HashMap::new()),
            auth_configs: RwLock::new(auth_configs),
            http,
            env,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ],
            refresh_interval: BACKGROUND_REFRESH_INTERVAL,
            background: StdMutex::new(None),
        })
    }

    /// Replace the inter-attempt delays (tests use zero delays).
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    fn auth_config(&self, name: &str) -> Option<AuthConfig> {
        self.auth_configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Called whenever the store's auth configs mutate.
    pub fn update_auth_configs(&self, configs: HashMap<String, AuthConfig>) {
        *self.auth_configs.write().unwrap_or_else(|e| e.into_inner()) = configs;
    }

    /// Current token for an auth config, refreshing when due.
    pub async fn get_token(&self, name: &str) -> anyhow::Result<String> {
        let Some(cfg) = self.auth_config(name) else {
            bail!("auth config not found: {name}");
        };

        // Static tokens come straight from the environment.
        if cfg.token_endpoint.is_none() {
            return Ok(cfg
                .env_var
                .as_deref()
                .map(|var| self.env.get(var))
                .unwrap_or_default());
        }

        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(name) {
            if Utc::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        self.refresh_locked(&mut tokens, name, &cfg).await
    }

    /// Manually install a token (management API).
    pub async fn set_token(&self, name: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        if self.auth_config(name).is_none() {
            bail!("auth config not found: {name}");
        }

        let now = Utc::now();
        let expires_at = now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(1));
        let token = ManagedToken {
            value,
            expires_at,
            refresh_at: expires_at - ChronoDuration::seconds(DEFAULT_REFRESH_BEFORE_EXPIRY),
            last_refresh: now,
            last_error: None,
            error_count: 0,
        };
        self.tokens.lock().await.insert(name.to_string(), token);
        Ok(())
    }

    pub async fn force_refresh(&self, name: &str) -> anyhow::Result<()> {
        let Some(cfg) = self.auth_config(name) else {
            bail!("auth config not found: {name}");
        };
        if cfg.token_endpoint.is_none() {
            bail!("auth config {name} does not have a token endpoint");
        }

        let mut tokens = self.tokens.lock().await;
        self.refresh_locked(&mut tokens, name, &cfg).await.map(|_| ())
    }

    pub async fn token_status(&self, name: &str) -> Option<TokenStatus> {
        let cfg = self.auth_config(name)?;
        let tokens = self.tokens.lock().await;
        let token = tokens.get(name);

        let mut status = TokenStatus {
            has_token: token.is_some(),
            expires_at: None,
            refresh_at: None,
            last_refresh: None,
            last_error: None,
            error_count: 0,
            is_expired: false,
            needs_refresh: false,
        };

        if let Some(token) = token {
            let now = Utc::now();
            status.expires_at = Some(token.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true));
            status.refresh_at = Some(token.refresh_at.to_rfc3339_opts(SecondsFormat::Secs, true));
            status.last_refresh =
                Some(token.last_refresh.to_rfc3339_opts(SecondsFormat::Secs, true));
            status.last_error = token.last_error.clone();
            status.error_count = token.error_count;
            status.is_expired = now > token.expires_at;
            status.needs_refresh = now > token.refresh_at;
        }

        // Static env tokens are always available.
        if cfg.token_endpoint.is_none() {
            status.has_token = true;
        }

        Some(status)
    }

    async fn refresh_locked(
        &self,
        tokens: &mut HashMap<String, ManagedToken>,
        name: &str,
        cfg: &AuthConfig,
    ) -> anyhow::Result<String> {
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = tokens.get(name) {
            if Utc::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let attempts = self.retry_delays.len() + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delays[attempt - 1]).await;
                info!(auth = name, attempt, "retrying token refresh");
            }

            match self.fetch_token(cfg).await {
                Ok((value, expires_at)) => {
                    let refresh_before = if cfg.refresh_before_expiry == 0 {
                        DEFAULT_REFRESH_BEFORE_EXPIRY
                    } else {
                        cfg.refresh_before_expiry as i64
                    };
                    let token = ManagedToken {
                        value: value.clone(),
                        expires_at,
                        refresh_at: expires_at - ChronoDuration::seconds(refresh_before),
                        last_refresh: Utc::now(),
                        last_error: None,
                        error_count: 0,
                    };
                    tokens.insert(name.to_string(), token);
                    telemetry::record_token_refresh("success");
                    info!(auth = name, expires_at = %expires_at, "refreshed token");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(auth = name, %err, "token refresh attempt failed");
                    last_error = Some(err);
                }
            }
        }

        telemetry::record_token_refresh("failure");
        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());

        // Stale-token fallback: keep serving the previous value.
        if let Some(existing) = tokens.get_mut(name) {
            existing.last_error = Some(last_error.clone());
            existing.error_count += 1;
            warn!(
                auth = name,
                error_count = existing.error_count,
                "token refresh failed, keeping existing token"
            );
            return Ok(existing.value.clone());
        }

        bail!("failed to refresh token for {name} after {attempts} attempts: {last_error}")
    }

    async fn fetch_token(&self, cfg: &AuthConfig) -> anyhow::Result<(String, DateTime<Utc>)> {
        let te = cfg
            .token_endpoint
            .as_ref()
            .context("no token endpoint configured")?;

        let url = te
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| {
                te.url_env
                    .as_deref()
                    .map(|var| self.env.get(var))
                    .filter(|u| !u.is_empty())
            })
            .context("token endpoint URL not configured")?;

        let method = te.method.as_deref().unwrap_or("POST").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .with_context(|| format!("invalid token endpoint method {method:?}"))?;

        let mut request = self
            .http
            .request(method, &url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (key, value) in &te.headers {
            request = request.header(key, value);
        }
        if let (Some(user_env), Some(pass_env)) = (&te.username_env, &te.password_env) {
            request = request.basic_auth(self.env.get(user_env), Some(self.env.get(pass_env)));
        }
        if let Some(body) = &te.body {
            let evaluated = template::evaluate_body(body, self.env.vars())
                .context("failed to evaluate token endpoint body template")?;
            request = request.json(&evaluated);
        }

        let response = request
            .send()
            .await
            .context("token endpoint request failed")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read token endpoint response")?;
        if !status.is_success() {
            bail!("token endpoint returned status {status}: {text}");
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).context("failed to parse token response as JSON")?;

        let token_value = extract_json_path(&json, &te.token_path)
            .context("failed to extract token from response")?;
        let token = token_value
            .as_str()
            .with_context(|| format!("token value is not a string: {token_value}"))?
            .to_string();

        let expires_at = match &te.expires_path {
            None => Utc::now() + ChronoDuration::hours(1),
            Some(path) => match extract_json_path(&json, path) {
                Err(err) => {
                    warn!(auth = %cfg.name, %err, "could not extract token expiry, defaulting to 1 hour");
                    Utc::now() + ChronoDuration::hours(1)
                }
                Ok(value) => expiry_from_value(&value).unwrap_or_else(|| {
                    warn!(auth = %cfg.name, %value, "unrecognized token expiry format, defaulting to 1 hour");
                    Utc::now() + ChronoDuration::hours(1)
                }),
            },
        };

        Ok((token, expires_at))
    }

    /// Start the single background worker that proactively refreshes
    /// tokens approaching expiry. A second call is a no-op.
    pub fn start_background_refresh(self: &Arc<Self>) {
        let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.refresh_interval);
            interval.tick().await; // first tick fires immediately
            info!(interval = ?manager.refresh_interval, "token manager background refresh started");
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = interval.tick() => manager.refresh_expiring().await,
                }
            }
            info!("token manager background refresh stopped");
        });
    }

    pub fn stop_background_refresh(&self) {
        if let Some(tx) = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(true);
        }
    }

    async fn refresh_expiring(&self) {
        let configs = self
            .auth_configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (name, cfg) in configs {
            if cfg.token_endpoint.is_none() {
                continue;
            }

            let mut tokens = self.tokens.lock().await;
            let due = tokens
                .get(&name)
                .map(|t| Utc::now() > t.refresh_at)
                .unwrap_or(false);
            if due {
                info!(auth = %name, "background refresh triggered");
                let _ = self.refresh_locked(&mut tokens, &name, &cfg).await;
            }
        }
    }
}

/// Interpret a JSON expiry value: values above 10^12 are epoch
/// milliseconds, above 10^9 epoch seconds, anything else seconds from now.
fn expiry_from_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let number = value.as_f64()?;
    if number > 1_000_000_000_000.0 {
        DateTime::from_timestamp_millis(number as i64)
    } else if number > 1_000_000_000.0 {
        DateTime::from_timestamp(number as i64, 0)
    } else {
        Some(Utc::now() + ChronoDuration::milliseconds((number * 1000.0) as i64))
    }
}
