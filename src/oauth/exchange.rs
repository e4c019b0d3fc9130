//! OAuth token endpoint calls: authorization-code exchange and refresh.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use super::OAuthProviderConfig;
use crate::credentials::{AccessToken, RefreshToken, TokenRefresher};

/// OAuth token response (standard OAuth 2.0 / OpenID Connect)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error body (RFC 6749 section 5.2)
#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Tokens issued by an authorization-code exchange
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Client for the provider's token endpoint.
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    provider: OAuthProviderConfig,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, provider: OAuthProviderConfig) -> Self {
        Self { http, provider }
    }

    pub fn provider(&self) -> &OAuthProviderConfig {
        &self.provider
    }

    /// Exchange an authorization code (with its PKCE verifier) for tokens
    ///
    /// # Arguments
    /// * `code` - Authorization code from callback
    /// * `redirect_uri` - Redirect URI used in authorization request
    /// * `code_verifier` - PKCE verifier whose challenge was sent at login
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant> {
        let mut form_data = HashMap::new();
        form_data.insert("grant_type", "authorization_code");
        form_data.insert("code", code);
        form_data.insert("redirect_uri", redirect_uri);
        form_data.insert("code_verifier", code_verifier);
        form_data.insert("client_id", self.provider.client_id.as_str());
        form_data.insert("client_secret", self.provider.client_secret.as_str());

        tracing::debug!("Exchanging authorization code for token at {}", self.provider.token_url);

        let token_response = self.post_token(&form_data).await?;

        tracing::debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token exchange successful"
        );

        // Lifetimes chrono cannot represent are treated as unknown
        let expires_at = token_response
            .expires_in
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));

        Ok(TokenGrant {
            access_token: AccessToken::new(token_response.access_token),
            refresh_token: token_response.refresh_token.map(RefreshToken::new),
            id_token: token_response.id_token,
            scope: token_response.scope,
            expires_at,
        })
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh_access_token(&self, refresh_token: &RefreshToken) -> Result<AccessToken> {
        let mut form_data = HashMap::new();
        form_data.insert("grant_type", "refresh_token");
        form_data.insert("refresh_token", refresh_token.expose());
        form_data.insert("client_id", self.provider.client_id.as_str());
        form_data.insert("client_secret", self.provider.client_secret.as_str());

        let token_response = self.post_token(&form_data).await?;
        Ok(AccessToken::new(token_response.access_token))
    }

    async fn post_token(&self, form_data: &HashMap<&str, &str>) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.provider.token_url)
            .header("Accept", "application/json")
            .form(form_data)
            .send()
            .await
            .context("Failed to send token request")?;

        let status = response.status();
        if !status.is_success() {
            // Only the OAuth error code is surfaced; bodies may echo request data
            let reason = match response.json::<TokenErrorResponse>().await {
                Ok(body) => match body.error_description {
                    Some(description) => format!("{}: {}", body.error, description),
                    None => body.error,
                },
                Err(_) => "unparseable error body".to_string(),
            };
            return Err(anyhow!("Token endpoint returned status {}: {}", status, reason));
        }

        response
            .json()
            .await
            .context("Failed to parse token response")
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<AccessToken> {
        self.refresh_access_token(refresh_token).await
    }
}
