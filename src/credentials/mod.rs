//! Refresh-token enrollment and access-token retrieval.
//!
//! At login the provider's refresh token is encrypted with the user's email
//! as associated data and stored in the user's session state. When the agent
//! later needs to call a Google API on the user's behalf, the envelope is
//! decrypted and exchanged for a fresh access token.
//!
//! # Failure model
//!
//! Retrieval is fail-soft. A missing envelope, an envelope that does not
//! decrypt for this user, and a refresh the provider rejects all produce the
//! same `None`. Callers treat that as "not authenticated" and send the user
//! back through login; which of the three happened is only logged, and never
//! with the secret.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::envelope::{CipherError, EnvelopeCipher};

mod tokens;


pub use tokens::{AccessToken, EncryptedToken, RefreshToken};

/// User-scoped session state key holding the encrypted Google refresh token
pub const USER_GOOGLE_STATE_KEY: &str = "user:google";

/// Exchanges a refresh token for an access token at the identity provider.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<AccessToken>;
}

/// Encrypts refresh tokens at enrollment and turns them into access tokens on use.
#[derive(Clone)]
pub struct CredentialManager {
    cipher: Arc<EnvelopeCipher>,
    refresher: Arc<dyn TokenRefresher>,
}

impl CredentialManager {
    pub fn new(cipher: Arc<EnvelopeCipher>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self { cipher, refresher }
    }

    /// Encrypts `token` bound to `user_id`.
    ///
    /// # Errors
    /// Propagates `CipherError::KeyAuthority` when the key authority cannot be
    /// used; enrollment must not continue without an envelope.
    pub async fn encrypt_token(
        &self,
        token: &RefreshToken,
        user_id: &str,
    ) -> Result<EncryptedToken, CipherError> {
        let encoded = self.cipher.encrypt_token(token.expose(), user_id).await?;
        debug!(user = %user_id, "Refresh token encrypted");
        Ok(EncryptedToken::new(encoded))
    }

    /// Decrypts the refresh token stored for `user_id`.
    ///
    /// Returns `None` when nothing is stored or the envelope does not open.
    pub async fn decrypt_token(
        &self,
        encrypted: Option<&EncryptedToken>,
        user_id: &str,
    ) -> Option<RefreshToken> {
        let encrypted = encrypted?;

        match self.cipher.decrypt_token(encrypted.as_str(), user_id).await {
            Ok(token) if !token.is_empty() => Some(RefreshToken::from(token)),
            Ok(_) => {
                warn!(user = %user_id, "Stored refresh token is empty");
                None
            }
            Err(CipherError::KeyAuthority(reason)) => {
                error!(user = %user_id, reason = %reason, "Key authority unavailable while decrypting refresh token");
                None
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to decrypt refresh token");
                None
            }
        }
    }

    /// Returns a fresh access token for `user_id`, or `None` if the user is not
    /// authenticated.
    pub async fn get_access_token(
        &self,
        encrypted: Option<&EncryptedToken>,
        user_id: &str,
    ) -> Option<AccessToken> {
        let refresh_token = self.decrypt_token(encrypted, user_id).await?;

        match self.refresher.refresh(&refresh_token).await {
            Ok(access_token) => {
                debug!(user = %user_id, "Access token obtained");
                Some(access_token)
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "Error refreshing token");
                None
            }
        }
    }

    /// Same as [`CredentialManager::get_access_token`], reading the envelope
    /// from session state under `state_key`.
    pub async fn get_access_token_from_state(
        &self,
        state: &Map<String, Value>,
        state_key: &str,
        user_id: &str,
    ) -> Option<AccessToken> {
        let encrypted = match state.get(state_key) {
            Some(Value::String(encoded)) => Some(EncryptedToken::new(encoded.clone())),
            Some(_) => {
                warn!(user = %user_id, key = %state_key, "Session state holds a non-string token");
                None
            }
            None => None,
        };

        self.get_access_token(encrypted.as_ref(), user_id).await
    }
}
