//! OAuth 2.0 authorization-code flow with PKCE against Google.
//!
//! 1. GET /login → redirect to the provider with state and S256 challenge
//! 2. User consents (offline access, so a refresh token is issued)
//! 3. Provider redirects to /callback with code and state
//! 4. Code + verifier exchanged for tokens
//! 5. Refresh token encrypted for the user and kept in session state
//! 6. Later, the refresh token is exchanged for short-lived access tokens

mod exchange;
pub mod pkce;
mod provider;
mod state_manager;

pub use exchange::{OAuthClient, TokenGrant};
pub use provider::{OAuthProviderConfig, DEFAULT_SCOPES, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
pub use state_manager::{run_state_cleanup, PendingLogin, StateManager};
