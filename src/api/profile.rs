use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{AppError, AppState};
use crate::auth::{extract_authenticated_email, extract_iap_assertion, HeaderError};
use crate::profile::ProfileError;

#[derive(Deserialize)]
pub struct ProfileQuery {
    #[serde(default)]
    include_email: bool,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    user: String,
    session_id: String,
    profile: String,
}

/// Identity of the caller from the proxy's signed assertion.
///
/// The unsigned email header, when present, must name the same user.
async fn authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let assertion = extract_iap_assertion(headers).map_err(|e| {
        debug!(error = %e, "No identity assertion on request");
        AppError::Unauthorized(format!("Invalid identity assertion: {}", e))
    })?;

    let email = state
        .verifier
        .verify(&assertion, &state.iap_audience, &state.iap_issuer)
        .await
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;

    match extract_authenticated_email(headers) {
        Ok(header_email) if header_email != email => {
            warn!(user = %email, header = %header_email, "Authenticated email header disagrees with assertion");
            Err(AppError::Unauthorized(
                "Identity headers disagree".to_string(),
            ))
        }
        Ok(_) | Err(HeaderError::Missing) => Ok(email),
        Err(e) => Err(AppError::Unauthorized(format!(
            "Invalid authenticated user header: {}",
            e
        ))),
    }
}

/// GET /api/profile
///
/// Runs the profile tool for the proxy-authenticated user.
///
/// # Errors
/// - 401: assertion missing or invalid, or no usable stored credential
/// - 502: userinfo lookup failed
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfileQuery>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, AppError> {
    let user = authenticated_user(&state, &headers).await?;

    let session = state
        .sessions
        .get_or_create_session(&state.app_name, &user, query.session_id.as_deref())
        .await
        .map_err(|e| {
            error!(user = %user, error = %e, "Failed to load session");
            AppError::ServerError("Failed to load session".to_string())
        })?;

    let profile = state
        .profile_tool()
        .get_user_profile(&session.state, &user, query.include_email)
        .await
        .map_err(|e| match e {
            ProfileError::NotAuthenticated => {
                AppError::Unauthorized("not authenticated".to_string())
            }
            ProfileError::Upstream(_) => {
                AppError::BadGateway("Failed to fetch user profile".to_string())
            }
        })?;

    Ok(Json(ProfileResponse {
        user,
        session_id: session.id,
        profile,
    }))
}
