//! Verification of identity assertions issued by Identity-Aware Proxy.
//!
//! The proxy in front of the service signs a short-lived ES256 JWT for every
//! request and passes it in the `x-goog-iap-jwt-assertion` header. A request
//! is trusted only when the signature verifies against the proxy's published
//! keys and issuer and audience match exactly.
//!
//! ## Security Model
//!
//! - Public keys fetched from the proxy's JWKS endpoint and cached
//!   (`Cache-Control: max-age` bounded to 5 minutes..1 day, 1 hour by default)
//! - Unknown key IDs trigger a refetch to follow key rotation, at most once
//!   per cooldown window while the cache is fresh
//! - Only ES256 is accepted, whatever the token header claims
//! - Every failure is the same [`VerifyError`]; detail goes to the log only

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

mod jwks;


pub use jwks::{Jwk, Jwks};

/// Issuer of proxy assertions
pub const IAP_ISSUER: &str = "https://cloud.google.com/iap";

/// Published proxy signing keys
pub const IAP_JWKS_URL: &str = "https://www.gstatic.com/iap/verify/public_key-jwk";

/// Minimum cache TTL in seconds (5 minutes)
const MIN_CACHE_TTL_SECS: i64 = 300;

/// Default cache TTL in seconds if Cache-Control header is missing (1 hour)
const DEFAULT_CACHE_TTL_SECS: i64 = 3600;

/// Maximum cache TTL in seconds (1 day)
const MAX_CACHE_TTL_SECS: i64 = 86_400;

/// Minimum spacing between refetches caused by unknown key IDs
const REFETCH_COOLDOWN_SECS: i64 = 30;

/// Clock skew tolerance for `exp`/`nbf`/`iat`
const LEEWAY_SECS: u64 = 60;

/// The assertion could not be verified.
#[derive(Debug, Error)]
#[error("identity assertion verification failed")]
pub struct VerifyError;

#[derive(Deserialize)]
struct AssertionClaims {
    #[serde(default)]
    email: Option<String>,
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CachedKeys {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Verifies proxy-issued identity assertions.
pub struct AssertionVerifier {
    http: reqwest::Client,
    jwks_url: String,
    refetch_cooldown: Duration,
    cached_keys: RwLock<Option<CachedKeys>>,
}

impl AssertionVerifier {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_jwks_url(http, IAP_JWKS_URL)
    }

    pub fn with_jwks_url(http: reqwest::Client, jwks_url: impl Into<String>) -> Self {
        Self {
            http,
            jwks_url: jwks_url.into(),
            refetch_cooldown: Duration::seconds(REFETCH_COOLDOWN_SECS),
            cached_keys: RwLock::new(None),
        }
    }

    /// Minimum time between refetches triggered by unknown key IDs.
    pub fn with_refetch_cooldown(mut self, seconds: u32) -> Self {
        self.refetch_cooldown = Duration::seconds(i64::from(seconds));
        self
    }

    /// Verifies `assertion` and returns its email claim.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if:
    /// - the header cannot be decoded, has no key ID or is not ES256
    /// - no published key matches the key ID
    /// - the signature is invalid or the token is expired
    /// - issuer or audience differ from the expected values
    /// - the email claim is missing or empty
    pub async fn verify(
        &self,
        assertion: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<String, VerifyError> {
        if expected_audience.is_empty() || expected_issuer.is_empty() {
            warn!("Assertion verifier called without an expected audience or issuer");
            return Err(VerifyError);
        }

        let header = decode_header(assertion).map_err(|e| {
            debug!(error = %e, "Failed to decode assertion header");
            VerifyError
        })?;

        if header.alg != Algorithm::ES256 {
            debug!(alg = ?header.alg, "Assertion uses an unexpected algorithm");
            return Err(VerifyError);
        }

        let kid = header.kid.ok_or_else(|| {
            debug!("Assertion missing key ID (kid) in header");
            VerifyError
        })?;

        let key = self.signing_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[expected_audience]);
        validation.set_issuer(&[expected_issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.leeway = LEEWAY_SECS;

        let token_data = decode::<AssertionClaims>(assertion, &key, &validation).map_err(|e| {
            debug!(error = %e, kid = %kid, "Assertion validation failed");
            VerifyError
        })?;

        let email = token_data
            .claims
            .email
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                debug!("Email claim is missing in assertion");
                VerifyError
            })?;

        debug!(user = %email, "Identity assertion verified");
        Ok(email)
    }

    /// Key for `kid`, from cache or a fresh fetch.
    async fn signing_key(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        if let Some(key) = self.cached_key(kid, true).await {
            return Ok(key);
        }

        if self.fetched_within_cooldown().await {
            debug!(kid = %kid, "Unknown kid and keys were fetched recently, not refetching");
            return Err(VerifyError);
        }

        self.refresh_keys().await?;

        self.cached_key(kid, false).await.ok_or_else(|| {
            debug!(kid = %kid, "Signing key not found for kid");
            VerifyError
        })
    }

    async fn cached_key(&self, kid: &str, require_fresh: bool) -> Option<DecodingKey> {
        let cache = self.cached_keys.read().await;
        cache.as_ref().and_then(|cached| {
            if require_fresh && !cached.is_fresh(Utc::now()) {
                return None;
            }
            cached.keys.get(kid).cloned()
        })
    }

    /// A fresh key set fetched less than one cooldown ago.
    async fn fetched_within_cooldown(&self) -> bool {
        let now = Utc::now();
        let cache = self.cached_keys.read().await;
        cache.as_ref().is_some_and(|cached| {
            cached.is_fresh(now) && now - cached.fetched_at < self.refetch_cooldown
        })
    }

    async fn refresh_keys(&self) -> Result<(), VerifyError> {
        info!(url = %self.jwks_url, "Fetching assertion signing keys");

        let response = self.http.get(&self.jwks_url).send().await.map_err(|e| {
            warn!(error = %e, "Failed to fetch assertion signing keys");
            VerifyError
        })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Signing key endpoint returned an error");
            return Err(VerifyError);
        }

        let cache_ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(jwks::parse_max_age)
            .unwrap_or(DEFAULT_CACHE_TTL_SECS)
            .clamp(MIN_CACHE_TTL_SECS, MAX_CACHE_TTL_SECS);

        let key_set: Jwks = response.json().await.map_err(|e| {
            warn!(error = %e, "Failed to parse signing keys");
            VerifyError
        })?;

        let keys = jwks::es256_keys(&key_set);
        let fetched_at = Utc::now();
        let expires_at = fetched_at + Duration::seconds(cache_ttl);

        info!(
            num_keys = keys.len(),
            cache_ttl_secs = cache_ttl,
            expires_at = %expires_at,
            "Assertion signing keys cached"
        );

        *self.cached_keys.write().await = Some(CachedKeys {
            keys,
            fetched_at,
            expires_at,
        });
        Ok(())
    }
}
