//! Key-encryption keys: wrap and unwrap per-record data keys.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use super::{encryption, CipherError};
use crate::gcp::TokenSource;

/// URI scheme for Cloud KMS keys
pub const GCP_KMS_PREFIX: &str = "gcp-kms://";

/// Cloud KMS REST endpoint
pub const KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

/// A key held by a key-encryption authority.
///
/// Implementations never expose the key itself; they only wrap and unwrap
/// data keys. Failures to reach or use the authority are
/// `CipherError::KeyAuthority`; a wrapped key the authority rejects as
/// corrupt is `CipherError::Authenticity`.
#[async_trait]
pub trait KeyEncryptionKey: Send + Sync {
    async fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>, CipherError>;

    async fn unwrap(&self, wrapped_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError>;
}

/// KEK held in process memory, for local development and tests.
pub struct LocalKek {
    key: Zeroizing<Vec<u8>>,
}

impl LocalKek {
    /// Builds a local KEK from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = encryption::validate_key(key_base64).context("Invalid local KEK")?;
        Ok(Self { key })
    }

    /// Builds a local KEK with a random key.
    pub fn generate() -> Self {
        Self {
            key: encryption::generate_key(),
        }
    }
}

#[async_trait]
impl KeyEncryptionKey for LocalKek {
    async fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>, CipherError> {
        encryption::seal(data_key, &[], &self.key)
    }

    async fn unwrap(&self, wrapped_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        encryption::open(wrapped_key, &[], &self.key)
    }
}

#[derive(Serialize)]
struct KmsEncryptRequest {
    plaintext: String,
}

#[derive(Deserialize)]
struct KmsEncryptResponse {
    ciphertext: String,
}

#[derive(Serialize)]
struct KmsDecryptRequest {
    ciphertext: String,
}

#[derive(Deserialize)]
struct KmsDecryptResponse {
    plaintext: String,
}

/// KEK stored in Google Cloud KMS, used through its REST API.
pub struct GcpKmsKek {
    http: reqwest::Client,
    endpoint: String,
    key_name: String,
    tokens: Arc<dyn TokenSource>,
}

impl GcpKmsKek {
    /// Builds a KMS KEK from a URI of the form
    /// `gcp-kms://projects/P/locations/L/keyRings/R/cryptoKeys/K`.
    pub fn from_uri(kek_uri: &str, http: reqwest::Client, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let key_name = parse_kek_uri(kek_uri)?;
        Ok(Self {
            http,
            endpoint: KMS_ENDPOINT.to_string(),
            key_name,
            tokens,
        })
    }

    /// Overrides the REST endpoint (emulators, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    async fn call(&self, verb: &str, body: &impl Serialize) -> Result<reqwest::Response, CipherError> {
        let token = self.tokens.token().await.map_err(|e| {
            warn!(error = %e, "Failed to obtain token for Cloud KMS");
            CipherError::KeyAuthority("no credentials for key authority".to_string())
        })?;

        let url = format!("{}/{}:{}", self.endpoint, self.key_name, verb);
        self.http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, verb, "Cloud KMS request failed");
                CipherError::KeyAuthority(format!("key authority unreachable: {}", e))
            })
    }
}

#[async_trait]
impl KeyEncryptionKey for GcpKmsKek {
    async fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>, CipherError> {
        let request = KmsEncryptRequest {
            plaintext: BASE64.encode(data_key),
        };
        let response = self.call("encrypt", &request).await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, key = %self.key_name, "Cloud KMS refused encrypt");
            return Err(CipherError::KeyAuthority(format!(
                "key authority returned status {}",
                status
            )));
        }

        let body: KmsEncryptResponse = response.json().await.map_err(|e| {
            CipherError::KeyAuthority(format!("invalid key authority response: {}", e))
        })?;

        BASE64
            .decode(body.ciphertext)
            .map_err(|e| CipherError::KeyAuthority(format!("invalid wrapped key encoding: {}", e)))
    }

    async fn unwrap(&self, wrapped_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let request = KmsDecryptRequest {
            ciphertext: BASE64.encode(wrapped_key),
        };
        let response = self.call("decrypt", &request).await?;

        match response.status() {
            status if status.is_success() => {}
            // KMS answers INVALID_ARGUMENT for a wrapped key it did not produce
            StatusCode::BAD_REQUEST => return Err(CipherError::Authenticity),
            status => {
                warn!(status = %status, key = %self.key_name, "Cloud KMS refused decrypt");
                return Err(CipherError::KeyAuthority(format!(
                    "key authority returned status {}",
                    status
                )));
            }
        }

        let body: KmsDecryptResponse = response.json().await.map_err(|e| {
            CipherError::KeyAuthority(format!("invalid key authority response: {}", e))
        })?;

        BASE64
            .decode(body.plaintext)
            .map(Zeroizing::new)
            .map_err(|e| CipherError::KeyAuthority(format!("invalid data key encoding: {}", e)))
    }
}

fn parse_kek_uri(kek_uri: &str) -> Result<String> {
    let key_name = kek_uri
        .strip_prefix(GCP_KMS_PREFIX)
        .ok_or_else(|| anyhow!("KEK URI must start with '{}'", GCP_KMS_PREFIX))?;

    let segments: Vec<&str> = key_name.split('/').collect();
    let well_formed = segments.len() == 8
        && segments[0] == "projects"
        && segments[2] == "locations"
        && segments[4] == "keyRings"
        && segments[6] == "cryptoKeys"
        && segments.iter().all(|s| !s.is_empty());

    if !well_formed {
        return Err(anyhow!(
            "KEK URI must look like {}projects/P/locations/L/keyRings/R/cryptoKeys/K",
            GCP_KMS_PREFIX
        ));
    }

    Ok(key_name.to_string())
}
