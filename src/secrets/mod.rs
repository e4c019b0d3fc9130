//! Secret lookup for startup configuration (OAuth client credentials).
//!
//! Configuration names secrets by ID; the values are resolved once at startup
//! through a [`SecretSource`]. In production that is Google Secret Manager,
//! locally the process environment.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use crate::gcp::TokenSource;

/// Default Secret Manager REST endpoint
pub const SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com/v1";

/// Secret lookup errors
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("failed to access secret '{id}': {reason}")]
    Access { id: String, reason: String },

    #[error("secret '{0}' is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Source of secret values by ID.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn get_secret(&self, secret_id: &str) -> Result<String, SecretError>;
}

/// Reads secrets from environment variables named by the secret ID.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretSource;

impl EnvSecretSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn get_secret(&self, secret_id: &str) -> Result<String, SecretError> {
        match std::env::var(secret_id) {
            Ok(value) if !value.is_empty() => Ok(value),
            Ok(_) => Err(SecretError::NotFound(secret_id.to_string())),
            Err(std::env::VarError::NotPresent) => {
                Err(SecretError::NotFound(secret_id.to_string()))
            }
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(SecretError::InvalidUtf8(secret_id.to_string()))
            }
        }
    }
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/// Google Secret Manager over REST, always reading the `latest` version.
pub struct SecretManagerSource {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    project_id: String,
    endpoint: String,
}

impl SecretManagerSource {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            project_id: project_id.into(),
            endpoint: SECRET_MANAGER_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn version_name(&self, secret_id: &str) -> String {
        format!(
            "projects/{}/secrets/{}/versions/latest",
            self.project_id, secret_id
        )
    }
}

#[async_trait]
impl SecretSource for SecretManagerSource {
    async fn get_secret(&self, secret_id: &str) -> Result<String, SecretError> {
        let access_error = |reason: String| {
            error!(
                project = %self.project_id,
                secret = %secret_id,
                reason = %reason,
                "Failed to access secret"
            );
            SecretError::Access {
                id: secret_id.to_string(),
                reason,
            }
        };

        let token = self
            .tokens
            .token()
            .await
            .map_err(|e| access_error(format!("no access token: {:#}", e)))?;

        let url = format!("{}/{}:access", self.endpoint, self.version_name(secret_id));
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| access_error(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(secret_id.to_string()));
        }
        if !status.is_success() {
            return Err(access_error(format!("status {}", status)));
        }

        let body: AccessSecretVersionResponse = response
            .json()
            .await
            .map_err(|e| access_error(format!("invalid response: {}", e)))?;

        let bytes = BASE64
            .decode(body.payload.data)
            .map_err(|e| access_error(format!("invalid payload encoding: {}", e)))?;

        debug!(secret = %secret_id, "Secret resolved");

        String::from_utf8(bytes).map_err(|_| SecretError::InvalidUtf8(secret_id.to_string()))
    }
}
