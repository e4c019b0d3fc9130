use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fmt;

use crate::envelope::{GCP_KMS_PREFIX, KMS_ENDPOINT};
use crate::gcp::METADATA_TOKEN_URL;
use crate::iap::{IAP_ISSUER, IAP_JWKS_URL};
use crate::oauth::{GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
use crate::profile::USERINFO_URL;
use crate::secrets::SECRET_MANAGER_ENDPOINT;

/// Complete service configuration
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Application name; scopes user state in the session store
    pub app_name: String,
    /// OAuth redirect URI registered with the provider
    pub redirect_uri: String,
    /// Expected `aud` of proxy assertions
    pub iap_audience: String,
    #[serde(default = "default_iap_issuer")]
    pub iap_issuer: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// `gcp-kms://projects/.../cryptoKeys/...`
    #[serde(default)]
    pub kms_key_uri: Option<String>,
    /// Base64 AES-256 key used instead of KMS for local development
    #[serde(default)]
    pub local_kek_key: Option<String>,
    /// Enables Secret Manager lookups; without it secrets come from env vars
    #[serde(default)]
    pub google_cloud_project: Option<String>,
    /// Secret ID of the OAuth client ID
    pub client_id_secret: String,
    /// Secret ID of the OAuth client secret
    pub client_secret_secret: String,
    /// SQLite session database; in-memory sessions when unset
    #[serde(default)]
    pub session_db: Option<String>,
    #[serde(default = "default_state_expiry")]
    pub oauth_state_expiry_seconds: i64,
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

/// Upstream endpoints, overridable for emulators
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_jwks_url")]
    pub jwks_url: String,
    #[serde(default = "default_kms_endpoint")]
    pub kms_endpoint: String,
    #[serde(default = "default_secret_manager_endpoint")]
    pub secret_manager_endpoint: String,
    #[serde(default = "default_metadata_token_url")]
    pub metadata_token_url: String,
}

/// Which key-encryption key to use
#[derive(Clone, PartialEq, Eq)]
pub enum KekSetting {
    GcpKms(String),
    Local(String),
}

impl fmt::Debug for KekSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KekSetting::GcpKms(uri) => f.debug_tuple("GcpKms").field(uri).finish(),
            KekSetting::Local(_) => f.write_str("Local([REDACTED])"),
        }
    }
}

fn default_iap_issuer() -> String {
    IAP_ISSUER.to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_http_timeout() -> u64 {
    10
}

fn default_state_expiry() -> i64 {
    600
}

fn default_auth_url() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_url() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

fn default_userinfo_url() -> String {
    USERINFO_URL.to_string()
}

fn default_jwks_url() -> String {
    IAP_JWKS_URL.to_string()
}

fn default_kms_endpoint() -> String {
    KMS_ENDPOINT.to_string()
}

fn default_secret_manager_endpoint() -> String {
    SECRET_MANAGER_ENDPOINT.to_string()
}

fn default_metadata_token_url() -> String {
    METADATA_TOKEN_URL.to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            userinfo_url: default_userinfo_url(),
            jwks_url: default_jwks_url(),
            kms_endpoint: default_kms_endpoint(),
            secret_manager_endpoint: default_secret_manager_endpoint(),
            metadata_token_url: default_metadata_token_url(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_name", &self.app_name)
            .field("redirect_uri", &self.redirect_uri)
            .field("iap_audience", &self.iap_audience)
            .field("iap_issuer", &self.iap_issuer)
            .field("port", &self.port)
            .field("http_timeout_seconds", &self.http_timeout_seconds)
            .field("kms_key_uri", &self.kms_key_uri)
            .field(
                "local_kek_key",
                &self.local_kek_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("google_cloud_project", &self.google_cloud_project)
            .field("client_id_secret", &self.client_id_secret)
            .field("client_secret_secret", &self.client_secret_secret)
            .field("session_db", &self.session_db)
            .field("oauth_state_expiry_seconds", &self.oauth_state_expiry_seconds)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl Config {
    /// Build configuration from process environment variables.
    ///
    /// Required: `APP_NAME`, `REDIRECT_URI`, `IAP_AUDIENCE`,
    /// `GSM_GOOGLE_CLIENT_ID`, `GSM_GOOGLE_CLIENT_SECRET` and one of
    /// `GCP_KMS_KEY_URI` / `LOCAL_KEK_KEY`. All missing variables are
    /// reported in one error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let mut required = |name: &'static str| {
            get(name).unwrap_or_else(|| {
                missing.push(name);
                String::new()
            })
        };

        let app_name = required("APP_NAME");
        let redirect_uri = required("REDIRECT_URI");
        let iap_audience = required("IAP_AUDIENCE");
        let client_id_secret = required("GSM_GOOGLE_CLIENT_ID");
        let client_secret_secret = required("GSM_GOOGLE_CLIENT_SECRET");

        let kms_key_uri = get("GCP_KMS_KEY_URI");
        let local_kek_key = get("LOCAL_KEK_KEY");
        if kms_key_uri.is_none() && local_kek_key.is_none() {
            missing.push("GCP_KMS_KEY_URI (or LOCAL_KEK_KEY)");
        }

        if !missing.is_empty() {
            bail!(
                "Missing required environment variables: {}",
                missing.join(", ")
            );
        }

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid PORT '{}'", raw))?,
            None => default_port(),
        };

        let http_timeout_seconds = match get("HTTP_TIMEOUT_SECONDS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid HTTP_TIMEOUT_SECONDS '{}'", raw))?,
            None => default_http_timeout(),
        };

        let oauth_state_expiry_seconds = match get("OAUTH_STATE_EXPIRY_SECONDS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid OAUTH_STATE_EXPIRY_SECONDS '{}'", raw))?,
            None => default_state_expiry(),
        };

        let config = Self {
            app_name,
            redirect_uri,
            iap_audience,
            iap_issuer: get("IAP_ISSUER").unwrap_or_else(default_iap_issuer),
            port,
            http_timeout_seconds,
            kms_key_uri,
            local_kek_key,
            google_cloud_project: get("GOOGLE_CLOUD_PROJECT"),
            client_id_secret,
            client_secret_secret,
            session_db: get("SESSION_DB"),
            oauth_state_expiry_seconds,
            endpoints: EndpointConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints not expressible in serde.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("app_name", &self.app_name),
            ("redirect_uri", &self.redirect_uri),
            ("iap_audience", &self.iap_audience),
            ("iap_issuer", &self.iap_issuer),
        ] {
            if value.is_empty() {
                bail!("Configuration value '{}' must not be empty", name);
            }
        }

        if self.http_timeout_seconds == 0 {
            bail!("http_timeout_seconds must be greater than zero");
        }

        if self.oauth_state_expiry_seconds <= 0 {
            bail!("oauth_state_expiry_seconds must be greater than zero");
        }

        self.kek().map(|_| ())
    }

    /// The configured key-encryption key; exactly one must be set.
    pub fn kek(&self) -> Result<KekSetting> {
        match (&self.kms_key_uri, &self.local_kek_key) {
            (Some(uri), None) => {
                if !uri.starts_with(GCP_KMS_PREFIX) {
                    return Err(anyhow!(
                        "kms_key_uri must start with '{}'",
                        GCP_KMS_PREFIX
                    ));
                }
                Ok(KekSetting::GcpKms(uri.clone()))
            }
            (None, Some(key)) => Ok(KekSetting::Local(key.clone())),
            (Some(_), Some(_)) => Err(anyhow!(
                "Set only one of kms_key_uri and local_kek_key"
            )),
            (None, None) => Err(anyhow!(
                "A key-encryption key is required: set kms_key_uri or local_kek_key"
            )),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file '{}'", path))?;
    config.validate()?;
    Ok(config)
}
