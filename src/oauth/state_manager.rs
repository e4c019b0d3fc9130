//! Pending logins keyed by their single-use CSRF state.
//!
//! A login remembers what the callback needs to redeem the authorization
//! code: the PKCE verifier and the redirect URI sent to the provider, which
//! the token endpoint requires to match exactly.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Login started at /login and not yet completed
#[derive(Clone, Debug)]
pub struct PendingLogin {
    pub code_verifier: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

impl PendingLogin {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }
}

/// Pending logins with a fixed lifetime
#[derive(Clone)]
pub struct StateManager {
    pending: Arc<Mutex<HashMap<String, PendingLogin>>>,
    ttl: Duration,
}

impl StateManager {
    /// `ttl_seconds` is how long a login may take (600 by default)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::try_seconds(ttl_seconds).unwrap_or(Duration::zero()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingLogin>> {
        // Entries are plain data; a panic mid-insert cannot leave them inconsistent
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a login and returns its state token (UUID v4).
    pub fn begin(&self, code_verifier: &str, redirect_uri: &str) -> String {
        let state = Uuid::new_v4().to_string();
        let login = PendingLogin {
            code_verifier: code_verifier.to_string(),
            redirect_uri: redirect_uri.to_string(),
            created_at: Utc::now(),
        };

        self.lock().insert(state.clone(), login);
        state
    }

    /// Removes the login for `state`, returning it only if it has not expired.
    ///
    /// An expired entry is dropped too, so a token is never usable twice.
    pub fn complete(&self, state: &str) -> Option<PendingLogin> {
        let login = self.lock().remove(state)?;
        (!login.is_expired(Utc::now(), self.ttl)).then_some(login)
    }

    /// Drops expired logins; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, login| !login.is_expired(now, self.ttl));
        before - pending.len()
    }

    /// Number of logins in flight
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

/// Periodically drops abandoned logins.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let removed = manager.cleanup_expired();
        tracing::debug!(
            removed,
            remaining = manager.count(),
            "Expired OAuth states cleaned up"
        );
    }
}
