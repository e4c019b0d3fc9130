//! OAuth access tokens for calling Google Cloud REST APIs (Cloud KMS, Secret Manager).
//!
//! On Cloud Run and GCE the workload identity is exposed by the metadata
//! server. Tokens are cached until shortly before they expire.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Default metadata-server token endpoint for the attached service account
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Reported lifetimes above this are capped (metadata tokens last about an hour)
const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

/// Source of bearer tokens for Google Cloud APIs.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Fixed token, for local development against an emulator and for tests.
pub struct StaticTokenSource(String);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Token source backed by the instance metadata server.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    url: String,
    cached: RwLock<Option<CachedToken>>,
}

impl MetadataTokenSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_url(http, METADATA_TOKEN_URL)
    }

    pub fn with_url(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            cached: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("Failed to reach metadata server")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Metadata server returned status {}",
                response.status()
            ));
        }

        let body: MetadataTokenResponse = response
            .json()
            .await
            .context("Failed to parse metadata token response")?;

        debug!(expires_in = body.expires_in, "Fetched metadata access token");

        let lifetime = body.expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS) - EXPIRY_MARGIN_SECS;

        Ok(CachedToken {
            token: body.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        })
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<String> {
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.expires_at > Utc::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *self.cached.write().await = Some(fresh);
        Ok(token)
    }
}
