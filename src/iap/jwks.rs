//! JWKS (JSON Web Key Set) parsing for EC P-256 signing keys.

use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// JWKS response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// JSON Web Key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (EC, RSA, ...)
    pub kty: String,

    /// Curve for EC keys
    #[serde(default)]
    pub crv: Option<String>,

    /// Key use (sig, enc)
    #[serde(rename = "use", default)]
    pub use_: Option<String>,

    /// Algorithm
    #[serde(default)]
    pub alg: Option<String>,

    /// Key ID
    #[serde(default)]
    pub kid: Option<String>,

    /// EC x coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Builds an ES256 verification key, or `None` if this entry is not one.
    fn es256_key(&self) -> Option<DecodingKey> {
        if self.kty != "EC" || self.crv.as_deref() != Some("P-256") {
            return None;
        }
        if self.use_.as_deref().is_some_and(|u| u != "sig") {
            return None;
        }
        if self.alg.as_deref().is_some_and(|a| a != "ES256") {
            return None;
        }

        let (x, y) = (self.x.as_deref()?, self.y.as_deref()?);
        DecodingKey::from_ec_components(x, y).ok()
    }
}

/// Indexes the usable ES256 keys of a key set by key ID.
///
/// Entries without a `kid`, of another type or with broken coordinates are skipped.
pub fn es256_keys(jwks: &Jwks) -> HashMap<String, DecodingKey> {
    jwks.keys
        .iter()
        .filter_map(|jwk| {
            let kid = jwk.kid.clone()?;
            match jwk.es256_key() {
                Some(key) => Some((kid, key)),
                None => {
                    debug!(kid = %kid, kty = %jwk.kty, "Skipping unusable JWK");
                    None
                }
            }
        })
        .collect()
}

/// Parse max-age value from Cache-Control header
///
/// Example: "public, max-age=3600, must-revalidate" -> 3600
pub fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|seconds| seconds.parse().ok())
}
