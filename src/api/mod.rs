//! HTTP API: OAuth enrollment and the agent's profile tool.
//!
//! - `GET /login`: redirect to the provider with CSRF state and PKCE challenge
//! - `GET /callback`: exchange the code, store the encrypted refresh token
//! - `GET /api/profile`: profile of the proxy-authenticated user
//! - `GET /health`: liveness

mod login;
mod profile;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::credentials::CredentialManager;
use crate::iap::AssertionVerifier;
use crate::oauth::{OAuthClient, StateManager};
use crate::profile::{ProfileClient, ProfileTool};
use crate::session::SessionStore;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    ServerError(String),
    BadGateway(String),
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Scopes user state in the session store
    pub app_name: String,
    pub redirect_uri: String,
    pub iap_audience: String,
    pub iap_issuer: String,
    pub oauth: Arc<OAuthClient>,
    pub state_manager: StateManager,
    pub credentials: Arc<CredentialManager>,
    pub sessions: Arc<dyn SessionStore>,
    pub verifier: Arc<AssertionVerifier>,
    pub profile_client: ProfileClient,
}

impl AppState {
    fn profile_tool(&self) -> ProfileTool {
        ProfileTool::new(self.credentials.clone(), self.profile_client.clone())
    }
}

/// Create the service router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/login", get(login::login))
        .route("/callback", get(login::callback))
        .route("/api/profile", get(profile::get_profile))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
