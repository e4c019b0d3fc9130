//! The agent's user-profile tool.
//!
//! Turns the caller's stored refresh token into a fresh access token and
//! reads the OpenID userinfo document with it.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{AccessToken, CredentialManager, USER_GOOGLE_STATE_KEY};
use crate::session::SessionState;

/// Google OpenID userinfo endpoint
pub const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Subset of the userinfo document the tool reports
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    /// No usable stored credential for the user
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("profile lookup failed: {0}")]
    Upstream(String),
}

/// Client for the userinfo endpoint.
#[derive(Clone)]
pub struct ProfileClient {
    http: reqwest::Client,
    userinfo_url: String,
}

impl ProfileClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_url(http, USERINFO_URL)
    }

    pub fn with_url(http: reqwest::Client, userinfo_url: impl Into<String>) -> Self {
        Self {
            http,
            userinfo_url: userinfo_url.into(),
        }
    }

    pub async fn fetch_userinfo(&self, access_token: &AccessToken) -> Result<UserInfo> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token.expose())
            .send()
            .await
            .context("Failed to reach userinfo endpoint")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Userinfo endpoint returned status {}",
                response.status()
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse userinfo response")
    }
}

/// Render the profile line returned to the agent.
pub fn describe(info: &UserInfo, include_email: bool) -> String {
    let name = info.name.as_deref().unwrap_or("unknown");
    if include_email {
        let email = info.email.as_deref().unwrap_or("unknown");
        format!("User profile: Name={}, Email={}", name, email)
    } else {
        format!("User profile: Name={}", name)
    }
}

/// Profile lookup on behalf of an authenticated user.
#[derive(Clone)]
pub struct ProfileTool {
    credentials: Arc<CredentialManager>,
    client: ProfileClient,
}

impl ProfileTool {
    pub fn new(credentials: Arc<CredentialManager>, client: ProfileClient) -> Self {
        Self {
            credentials,
            client,
        }
    }

    /// Describe the profile of `user_id` using the credential in `state`.
    ///
    /// # Errors
    /// - `NotAuthenticated`: no token stored, token undecryptable or refresh refused
    /// - `Upstream`: the userinfo call failed
    pub async fn get_user_profile(
        &self,
        state: &SessionState,
        user_id: &str,
        include_email: bool,
    ) -> Result<String, ProfileError> {
        let access_token = self
            .credentials
            .get_access_token_from_state(state, USER_GOOGLE_STATE_KEY, user_id)
            .await
            .ok_or(ProfileError::NotAuthenticated)?;

        let info = self
            .client
            .fetch_userinfo(&access_token)
            .await
            .map_err(|e| {
                warn!(user = %user_id, error = %e, "Userinfo lookup failed");
                ProfileError::Upstream(e.to_string())
            })?;

        debug!(user = %user_id, include_email, "Profile fetched");
        Ok(describe(&info, include_email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn info() -> UserInfo {
        UserInfo {
            email: Some("u1@example.com".to_string()),
            name: Some("User One".to_string()),
            picture: None,
        }
    }

    #[test]
    fn test_describe_with_email() {
        assert_eq!(
            describe(&info(), true),
            "User profile: Name=User One, Email=u1@example.com"
        );
    }

    #[test]
    fn test_describe_without_email() {
        assert_eq!(describe(&info(), false), "User profile: Name=User One");
    }

    #[tokio::test]
    async fn test_fetch_userinfo_sends_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "1234567890",
                "email": "u1@example.com",
                "verified_email": true,
                "name": "User One"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ProfileClient::with_url(
            reqwest::Client::new(),
            format!("{}/userinfo", server.uri()),
        );
        let info = client
            .fetch_userinfo(&AccessToken::new("access-1"))
            .await
            .unwrap();

        assert_eq!(info.email.as_deref(), Some("u1@example.com"));
        assert_eq!(info.name.as_deref(), Some("User One"));
    }

    #[tokio::test]
    async fn test_fetch_userinfo_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = ProfileClient::with_url(reqwest::Client::new(), server.uri());
        assert!(client
            .fetch_userinfo(&AccessToken::new("expired"))
            .await
            .is_err());
    }
}
