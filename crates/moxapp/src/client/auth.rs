use anyhow::{bail, Context};
use reqwest::RequestBuilder;

use super::token::TokenManager;
use crate::config::{AuthConfig, AuthType};
use crate::envfile::EnvSource;

/// Apply a resolved auth config to an outgoing request.
pub async fn apply_auth(
    builder: RequestBuilder,
    auth: &AuthConfig,
    tokens: &TokenManager,
    env: &EnvSource,
) -> anyhow::Result<RequestBuilder> {
    match auth.auth_type {
        AuthType::None => Ok(builder),

        AuthType::Bearer => {
            let token = tokens
                .get_token(&auth.name)
                .await
                .context("failed to get bearer token")?;
            if token.is_empty() {
                Ok(builder)
            } else {
                Ok(builder.bearer_auth(token))
            }
        }

        AuthType::ApiKey | AuthType::CustomHeader => {
            let Some(header) = auth.header_name.as_deref().filter(|h| !h.is_empty()) else {
                bail!(
                    "auth {}: header_name required for type {}",
                    auth.name,
                    auth.auth_type.as_str()
                );
            };
            let token = tokens
                .get_token(&auth.name)
                .await
                .context("failed to get api key")?;
            if token.is_empty() {
                Ok(builder)
            } else {
                Ok(builder.header(header.to_string(), token))
            }
        }

        AuthType::ApiKeyQuery => {
            let Some(param) = auth.query_param.as_deref().filter(|p| !p.is_empty()) else {
                bail!("auth {}: query_param required for api_key_query", auth.name);
            };
            let token = tokens
                .get_token(&auth.name)
                .await
                .context("failed to get api key")?;
            if token.is_empty() {
                Ok(builder)
            } else {
                Ok(builder.query(&[(param, token.as_str())]))
            }
        }

        AuthType::Basic => {
            let username = auth
                .username_env
                .as_deref()
                .map(|var| env.get(var))
                .unwrap_or_default();
            let password = auth
                .password_env
                .as_deref()
                .map(|var| env.get(var))
                .unwrap_or_default();
            if username.is_empty() && password.is_empty() {
                Ok(builder)
            } else {
                Ok(builder.basic_auth(username, Some(password)))
            }
        }
    }
}
