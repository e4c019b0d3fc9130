use agent_auth::api::{create_router, AppState};
use agent_auth::config::{load_config, Config, KekSetting};
use agent_auth::credentials::CredentialManager;
use agent_auth::envelope::{EnvelopeCipher, GcpKmsKek, KeyEncryptionKey, LocalKek};
use agent_auth::gcp::{MetadataTokenSource, TokenSource};
use agent_auth::iap::AssertionVerifier;
use agent_auth::oauth::{run_state_cleanup, OAuthClient, OAuthProviderConfig, StateManager};
use agent_auth::profile::ProfileClient;
use agent_auth::secrets::{EnvSecretSource, SecretManagerSource, SecretSource};
use agent_auth::session::{MemorySessionStore, SessionStore, SqliteSessionStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Path of an optional TOML config file; environment variables otherwise
const CONFIG_PATH_ENV: &str = "AGENT_AUTH_CONFIG";

/// How often expired OAuth states are purged
const STATE_CLEANUP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_auth=info,tower_http=info".into()),
        )
        .init();

    info!("agent-auth starting...");

    let config = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            info!(path = %path, "Loading configuration file");
            load_config(&path)?
        }
        Err(_) => Config::from_env()?,
    };

    info!(
        app = %config.app_name,
        port = config.port,
        session_db = ?config.session_db,
        "Configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let gcp_tokens: Arc<dyn TokenSource> = Arc::new(MetadataTokenSource::with_url(
        http.clone(),
        config.endpoints.metadata_token_url.clone(),
    ));

    // Secrets
    let secrets: Arc<dyn SecretSource> = match &config.google_cloud_project {
        Some(project) => {
            info!(project = %project, "Using Secret Manager for client credentials");
            Arc::new(
                SecretManagerSource::new(http.clone(), gcp_tokens.clone(), project.clone())
                    .with_endpoint(config.endpoints.secret_manager_endpoint.clone()),
            )
        }
        None => {
            info!("Using environment for client credentials");
            Arc::new(EnvSecretSource::new())
        }
    };

    let client_id = secrets
        .get_secret(&config.client_id_secret)
        .await
        .context("Failed to resolve OAuth client ID")?;
    let client_secret = secrets
        .get_secret(&config.client_secret_secret)
        .await
        .context("Failed to resolve OAuth client secret")?;

    // Key-encryption key
    let kek: Arc<dyn KeyEncryptionKey> = match config.kek()? {
        KekSetting::GcpKms(uri) => {
            let kek = GcpKmsKek::from_uri(&uri, http.clone(), gcp_tokens.clone())?
                .with_endpoint(config.endpoints.kms_endpoint.clone());
            info!(key = %kek.key_name(), "Using Cloud KMS key-encryption key");
            Arc::new(kek)
        }
        KekSetting::Local(key) => {
            info!("Using local key-encryption key (development only)");
            Arc::new(LocalKek::new(&key)?)
        }
    };
    let cipher = Arc::new(EnvelopeCipher::new(kek));

    // OAuth
    let mut provider = OAuthProviderConfig::google(client_id, client_secret);
    provider.auth_url = config.endpoints.auth_url.clone();
    provider.token_url = config.endpoints.token_url.clone();
    let oauth = Arc::new(OAuthClient::new(http.clone(), provider));

    let credentials = Arc::new(CredentialManager::new(cipher, oauth.clone()));

    // Sessions
    let sessions: Arc<dyn SessionStore> = match &config.session_db {
        Some(path) => {
            info!(path = %path, "Using SQLite session store");
            Arc::new(SqliteSessionStore::new(path)?)
        }
        None => {
            info!("Using in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    };

    let verifier = Arc::new(AssertionVerifier::with_jwks_url(
        http.clone(),
        config.endpoints.jwks_url.clone(),
    ));

    let state_manager = StateManager::new(config.oauth_state_expiry_seconds);
    tokio::spawn(run_state_cleanup(
        state_manager.clone(),
        STATE_CLEANUP_INTERVAL_SECS,
    ));

    let state = AppState {
        app_name: config.app_name.clone(),
        redirect_uri: config.redirect_uri.clone(),
        iap_audience: config.iap_audience.clone(),
        iap_issuer: config.iap_issuer.clone(),
        oauth,
        state_manager,
        credentials,
        sessions,
        verifier,
        profile_client: ProfileClient::with_url(http, config.endpoints.userinfo_url.clone()),
    };

    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
