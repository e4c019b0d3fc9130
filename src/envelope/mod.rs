//! Envelope encryption of small secrets under a remote key-encryption key.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       EnvelopeCipher                     │
//! │  - fresh data key per record             │
//! │  - associated data bound per record      │
//! └─────────────────────────────────────────┘
//!          ↓ wrap              ↑ unwrap
//! ┌─────────────────────────────────────────┐
//! │       KeyEncryptionKey                   │
//! │  - Cloud KMS (production)                │
//! │  - local AES key (development)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! ```text
//! | u32 BE len(wrapped key) | wrapped key | nonce (12) | ciphertext + tag (16) |
//! ```
//!
//! The data key is wrapped with empty associated data; the record's
//! associated data is bound in the data layer only, so a ciphertext moved to a
//! different identity fails authentication.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;
use zeroize::Zeroizing;

mod encryption;
mod kek;

pub use encryption::validate_key;
pub use kek::{GcpKmsKek, KeyEncryptionKey, LocalKek, GCP_KMS_PREFIX, KMS_ENDPOINT};

/// Size of the wrapped-key length prefix
const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on a wrapped data key; anything larger is not ours
const MAX_WRAPPED_KEY_SIZE: usize = 4096;

/// Envelope encryption failures.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key-encryption authority is unreachable or refused the operation
    #[error("key encryption authority unavailable: {0}")]
    KeyAuthority(String),

    /// Ciphertext or associated data did not authenticate
    #[error("ciphertext failed authentication")]
    Authenticity,

    /// Input is not a well-formed envelope
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Authenticated envelope encryption with per-record associated data.
#[derive(Clone)]
pub struct EnvelopeCipher {
    kek: Arc<dyn KeyEncryptionKey>,
}

impl EnvelopeCipher {
    pub fn new(kek: Arc<dyn KeyEncryptionKey>) -> Self {
        Self { kek }
    }

    /// Encrypts `plaintext`, binding `associated_data`.
    ///
    /// Fails closed: if the data key cannot be wrapped no output is produced.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let data_key = encryption::generate_key();
        let wrapped = self.kek.wrap(&data_key).await?;

        if wrapped.len() > MAX_WRAPPED_KEY_SIZE {
            return Err(CipherError::KeyAuthority(format!(
                "wrapped key is {} bytes",
                wrapped.len()
            )));
        }

        let sealed = encryption::seal(plaintext, associated_data, &data_key)?;

        let mut envelope = Vec::with_capacity(LENGTH_PREFIX_SIZE + wrapped.len() + sealed.len());
        envelope.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
        envelope.extend_from_slice(&wrapped);
        envelope.extend_from_slice(&sealed);
        Ok(envelope)
    }

    /// Decrypts an envelope produced by [`EnvelopeCipher::encrypt`].
    ///
    /// # Errors
    /// * `CipherError::Authenticity` - associated data differs from encryption time,
    ///   or any byte of the envelope was altered
    /// * `CipherError::KeyAuthority` - the data key could not be unwrapped
    /// * `CipherError::Malformed` - framing is broken
    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let (wrapped, sealed) = split_envelope(ciphertext)?;
        let data_key = self.kek.unwrap(wrapped).await?;
        encryption::open(sealed, associated_data, &data_key)
    }

    /// Encrypts a token string and returns the envelope as base64 text.
    pub async fn encrypt_token(
        &self,
        token: &str,
        associated_data: &str,
    ) -> Result<String, CipherError> {
        let envelope = self
            .encrypt(token.as_bytes(), associated_data.as_bytes())
            .await?;
        Ok(BASE64.encode(envelope))
    }

    /// Decrypts a base64 envelope produced by [`EnvelopeCipher::encrypt_token`].
    ///
    /// The token is returned in the plaintext's own buffer, wiped on drop.
    pub async fn decrypt_token(
        &self,
        encrypted: &str,
        associated_data: &str,
    ) -> Result<Zeroizing<String>, CipherError> {
        let envelope = BASE64
            .decode(encrypted.trim())
            .map_err(|e| CipherError::Malformed(format!("invalid base64: {}", e)))?;

        let mut plaintext = self.decrypt(&envelope, associated_data.as_bytes()).await?;
        let bytes = std::mem::take(&mut *plaintext);

        String::from_utf8(bytes).map(Zeroizing::new).map_err(|e| {
            drop(Zeroizing::new(e.into_bytes()));
            CipherError::Malformed("plaintext is not valid UTF-8".to_string())
        })
    }
}

fn split_envelope(envelope: &[u8]) -> Result<(&[u8], &[u8]), CipherError> {
    if envelope.len() < LENGTH_PREFIX_SIZE {
        return Err(CipherError::Malformed("envelope too short".to_string()));
    }

    let (prefix, rest) = envelope.split_at(LENGTH_PREFIX_SIZE);
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    len_bytes.copy_from_slice(prefix);
    let wrapped_len = u32::from_be_bytes(len_bytes) as usize;

    if wrapped_len == 0 || wrapped_len > MAX_WRAPPED_KEY_SIZE || wrapped_len > rest.len() {
        return Err(CipherError::Malformed(format!(
            "invalid wrapped key length {}",
            wrapped_len
        )));
    }

    Ok(rest.split_at(wrapped_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Authority that is always down.
    struct UnreachableKek;

    #[async_trait]
    impl KeyEncryptionKey for UnreachableKek {
        async fn wrap(&self, _data_key: &[u8]) -> Result<Vec<u8>, CipherError> {
            Err(CipherError::KeyAuthority("connection refused".to_string()))
        }

        async fn unwrap(&self, _wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
            Err(CipherError::KeyAuthority("connection refused".to_string()))
        }
    }

    fn local_cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(Arc::new(LocalKek::generate()))
    }

    #[tokio::test]
    async fn test_token_roundtrip() {
        let cipher = local_cipher();

        let encrypted = cipher
            .encrypt_token("refresh-abc", "u1@example.com")
            .await
            .unwrap();
        assert!(!encrypted.contains("refresh-abc"));

        let decrypted = cipher
            .decrypt_token(&encrypted, "u1@example.com")
            .await
            .unwrap();
        assert_eq!(decrypted.as_str(), "refresh-abc");
    }

    #[tokio::test]
    async fn test_non_utf8_token_is_malformed() {
        let cipher = local_cipher();
        let envelope = cipher.encrypt(&[0xff, 0xfe, 0x00], b"u1").await.unwrap();

        assert!(matches!(
            cipher.decrypt_token(&BASE64.encode(envelope), "u1").await,
            Err(CipherError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_other_identity_cannot_decrypt() {
        let cipher = local_cipher();

        let encrypted = cipher
            .encrypt_token("refresh-abc", "u1@example.com")
            .await
            .unwrap();

        let result = cipher.decrypt_token(&encrypted, "u2@example.com").await;
        assert!(matches!(result, Err(CipherError::Authenticity)));
    }

    #[tokio::test]
    async fn test_empty_associated_data_is_distinct() {
        let cipher = local_cipher();
        let envelope = cipher.encrypt(b"secret", b"").await.unwrap();

        assert_eq!(cipher.decrypt(&envelope, b"").await.unwrap().as_slice(), b"secret");
        assert!(matches!(
            cipher.decrypt(&envelope, b"u1@example.com").await,
            Err(CipherError::Authenticity)
        ));
    }

    #[tokio::test]
    async fn test_envelope_layout() {
        let cipher = local_cipher();
        let envelope = cipher.encrypt(b"secret", b"aad").await.unwrap();

        let (wrapped, sealed) = split_envelope(&envelope).unwrap();
        // Local KEK wraps a 32-byte key with its own nonce and tag
        assert_eq!(wrapped.len(), 12 + 32 + 16);
        assert_eq!(sealed.len(), 12 + "secret".len() + 16);
    }

    #[tokio::test]
    async fn test_tampered_data_layer_fails_authentication() {
        let cipher = local_cipher();
        let mut envelope = cipher.encrypt(b"secret", b"aad").await.unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x80;

        assert!(matches!(
            cipher.decrypt(&envelope, b"aad").await,
            Err(CipherError::Authenticity)
        ));
    }

    #[tokio::test]
    async fn test_ciphertext_from_other_kek_fails() {
        let envelope = local_cipher().encrypt(b"secret", b"aad").await.unwrap();

        assert!(matches!(
            local_cipher().decrypt(&envelope, b"aad").await,
            Err(CipherError::Authenticity)
        ));
    }

    #[tokio::test]
    async fn test_encrypt_fails_closed_when_authority_down() {
        let cipher = EnvelopeCipher::new(Arc::new(UnreachableKek));

        let result = cipher.encrypt_token("refresh-abc", "u1@example.com").await;
        assert!(matches!(result, Err(CipherError::KeyAuthority(_))));
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let cipher = local_cipher();

        assert!(matches!(
            cipher.decrypt_token("not base64!!", "u1").await,
            Err(CipherError::Malformed(_))
        ));
        assert!(matches!(
            cipher.decrypt(&[0, 0], b"u1").await,
            Err(CipherError::Malformed(_))
        ));
        // Length prefix claims more bytes than present
        assert!(matches!(
            cipher.decrypt(&[0, 0, 0, 200, 1, 2, 3], b"u1").await,
            Err(CipherError::Malformed(_))
        ));
    }
}
