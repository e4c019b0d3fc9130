//! AES-256-GCM primitives for the data-encryption layer of the envelope.
//!
//! Every sealed value carries its own random nonce in front of the ciphertext.
//! Associated data is authenticated but not stored; the caller must present the
//! same bytes again to open the value.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

use super::CipherError;

/// Size of a data-encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Validates that a configured key is exactly 32 bytes when base64 decoded.
///
/// # Arguments
/// * `key_base64` - Base64-encoded key
///
/// # Returns
/// * `Ok(Zeroizing<Vec<u8>>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key_bytes = Zeroizing::new(
        BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?,
    );

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Generates a fresh random data-encryption key.
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    Zeroizing::new(key.to_vec())
}

/// Encrypts `plaintext` under `key`, binding `associated_data`.
///
/// Returns `nonce || ciphertext || tag`.
pub fn seal(plaintext: &[u8], associated_data: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;

    // Random nonce per call; a key is never used twice with the same nonce
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CipherError::Malformed("plaintext too large to seal".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts a value produced by [`seal`].
///
/// # Errors
/// * `CipherError::Malformed` - value shorter than a nonce plus tag
/// * `CipherError::Authenticity` - wrong key, wrong associated data or tampered bytes
pub fn open(
    sealed: &[u8],
    associated_data: &[u8],
    key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CipherError::Malformed(format!(
            "sealed value is {} bytes, expected at least {}",
            sealed.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }

    let cipher = cipher_for(key)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CipherError::Authenticity)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_SIZE {
        return Err(CipherError::Malformed(format!(
            "key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::Malformed(e.to_string()))
}
