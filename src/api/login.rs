//! OAuth enrollment.
//!
//! 1. GET /login → redirect to the provider (state + PKCE challenge)
//! 2. User consents at the provider
//! 3. GET /callback → exchange code, look up the email, encrypt the refresh
//!    token bound to that email and store it as user-scoped session state
//!
//! Nothing is stored unless exchange, lookup and encryption all succeed.

use axum::{
    extract::{Query, State},
    response::{Json, Redirect},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{AppError, AppState};
use crate::credentials::USER_GOOGLE_STATE_KEY;
use crate::envelope::CipherError;
use crate::oauth::pkce;
use crate::session::SessionState;

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Enrollment success response
#[derive(Serialize)]
pub struct LoginResponse {
    success: bool,
    user: String,
    session_id: String,
}

/// GET /login
///
/// # Security
/// - Single-use CSRF state, 10-minute expiry by default
/// - PKCE verifier and redirect URI stay server-side with the pending login
pub async fn login(State(state): State<Arc<AppState>>) -> Redirect {
    let code_verifier = pkce::generate_verifier();
    let code_challenge = pkce::challenge_s256(&code_verifier);
    let csrf_state = state
        .state_manager
        .begin(&code_verifier, &state.redirect_uri);

    let auth_url = state.oauth.provider().build_auth_url(
        &csrf_state,
        &state.redirect_uri,
        &code_challenge,
    );

    info!("Redirecting to OAuth provider");

    Redirect::temporary(&auth_url)
}

/// GET /callback
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<LoginResponse>, AppError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");
        return Err(AppError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let pending = state
        .state_manager
        .complete(&csrf_state)
        .ok_or_else(|| {
            warn!("Invalid or expired OAuth state");
            AppError::Unauthorized(
                "Invalid or expired OAuth state (possible CSRF attack)".to_string(),
            )
        })?;

    debug!("CSRF state validated");

    let grant = state
        .oauth
        .exchange_code(&code, &pending.redirect_uri, &pending.code_verifier)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to exchange authorization code");
            AppError::BadGateway("Failed to exchange authorization code".to_string())
        })?;

    let refresh_token = grant.refresh_token.ok_or_else(|| {
        warn!("Provider did not return a refresh token");
        AppError::BadGateway("Provider did not return a refresh token".to_string())
    })?;

    let user_info = state
        .profile_client
        .fetch_userinfo(&grant.access_token)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to fetch user info after exchange");
            AppError::BadGateway("Failed to fetch user info".to_string())
        })?;

    let email = user_info
        .email
        .filter(|email| !email.is_empty())
        .ok_or_else(|| {
            warn!("User info has no email");
            AppError::BadGateway("Provider did not return an email".to_string())
        })?;

    let encrypted = state
        .credentials
        .encrypt_token(&refresh_token, &email)
        .await
        .map_err(|e| match e {
            CipherError::KeyAuthority(reason) => {
                error!(user = %email, reason = %reason, "Key authority unavailable during enrollment");
                AppError::ServiceUnavailable("authentication unavailable".to_string())
            }
            other => {
                error!(user = %email, error = %other, "Failed to encrypt refresh token");
                AppError::ServerError("Failed to store credentials".to_string())
            }
        })?;

    let mut session_state = SessionState::new();
    session_state.insert(
        USER_GOOGLE_STATE_KEY.to_string(),
        Value::String(encrypted.as_str().to_string()),
    );

    let session = state
        .sessions
        .create_session(&state.app_name, &email, session_state)
        .await
        .map_err(|e| {
            error!(user = %email, error = %e, "Failed to create session");
            AppError::ServerError("Failed to store credentials".to_string())
        })?;

    info!(user = %email, session = %session.id, "User enrolled");

    Ok(Json(LoginResponse {
        success: true,
        user: email,
        session_id: session.id,
    }))
}
