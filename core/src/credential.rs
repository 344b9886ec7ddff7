use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AgentServiceError;

const AGENTS_RESOURCE: &str = "https://ai.azure.com";
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Supplies bearer tokens for the agent service.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<SecretString, AgentServiceError>;
}

/// A pre-issued token, e.g. from `PROJECT_ACCESS_TOKEN`.
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: SecretString) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<SecretString, AgentServiceError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default, rename = "expires_on")]
    expires_on: Option<i64>,
}

struct Cached {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// Tokens from the signed-in Azure CLI, cached until shortly before expiry.
pub struct AzureCliToken {
    cached: Mutex<Option<Cached>>,
}

impl AzureCliToken {
    pub fn new() -> Self {
        Self { cached: Mutex::new(None) }
    }

    async fn fetch(&self) -> Result<Cached, AgentServiceError> {
        let output = Command::new("az")
            .args(["account", "get-access-token", "--resource", AGENTS_RESOURCE, "--output", "json"])
            .output()
            .await
            .map_err(|e| AgentServiceError::Credential(format!("could not run `az`: {e}")))?;

        if !output.status.success() {
            return Err(AgentServiceError::Credential(format!(
                "`az account get-access-token` failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let parsed: CliToken = serde_json::from_slice(&output.stdout)
            .map_err(|e| AgentServiceError::Credential(format!("unexpected `az` output: {e}")))?;
        let expires_at = parsed
            .expires_on
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(30));

        info!(%expires_at, "acquired agent service token from Azure CLI");
        Ok(Cached { token: SecretString::from(parsed.access_token), expires_at })
    }
}

impl Default for AzureCliToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for AzureCliToken {
    async fn token(&self) -> Result<SecretString, AgentServiceError> {
        let mut cached = self.cached.lock().await;
        let margin = chrono::Duration::minutes(REFRESH_MARGIN_MINUTES);
        if let Some(current) = cached.as_ref() {
            if current.expires_at - margin > Utc::now() {
                return Ok(current.token.clone());
            }
            debug!("cached agent service token is about to expire");
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

/// Picks the static token when one is configured, the Azure CLI otherwise.
pub fn from_settings(access_token: Option<&SecretString>) -> Arc<dyn TokenProvider> {
    match access_token {
        Some(token) if !token.expose_secret().is_empty() => Arc::new(StaticToken::new(token.clone())),
        _ => Arc::new(AzureCliToken::new()),
    }
}
