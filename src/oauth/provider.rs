//! OAuth provider configuration.
//!
//! Only Google is supported; endpoints are overridable for tests.

use serde::{Deserialize, Serialize};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes requested at login
pub const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];

/// OAuth provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token endpoint URL (code exchange and refresh)
    pub token_url: String,

    /// Requested OAuth scopes
    pub scopes: Vec<String>,

    /// Client ID (resolved from the secret source)
    pub client_id: String,

    /// Client secret (resolved from the secret source)
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl OAuthProviderConfig {
    /// Google provider with the default endpoints and scopes.
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Build the authorization URL.
    ///
    /// Asks for offline access with forced consent so the provider always
    /// returns a refresh token, and binds the request to a PKCE S256 challenge.
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code\
             &code_challenge={}&code_challenge_method=S256\
             &access_type=offline&prompt=consent&include_granted_scopes=true",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }
}
