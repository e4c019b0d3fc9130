//! Agent session store.
//!
//! Sessions are keyed by (application, user, session id) and carry a JSON
//! state map. Keys starting with `user:` are user-scoped: they are shared by
//! every session of the same user within an application and survive new
//! sessions. The encrypted refresh token lives under such a key so any later
//! session of the user can reach it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod memory;
mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Prefix marking user-scoped state keys
pub const USER_PREFIX: &str = "user:";

/// Session state map
pub type SessionState = Map<String, Value>;

/// A session of one user with one application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    /// Session-scoped entries merged with the user's current user-scoped entries
    pub state: SessionState,
    pub last_update_time: DateTime<Utc>,
}

/// Storage for agent sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session with `state`; user-scoped keys update the user's shared state.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: SessionState,
    ) -> Result<Session>;

    /// Looks a session up; `None` if it does not exist for this app and user.
    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>>;

    /// Returns the named session if it exists, otherwise a new empty session.
    async fn get_or_create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session> {
        if let Some(session_id) = session_id {
            if let Some(session) = self.get_session(app_name, user_id, session_id).await? {
                return Ok(session);
            }
            tracing::debug!(session = %session_id, "Session not found, creating a new one");
        }

        self.create_session(app_name, user_id, SessionState::new())
            .await
    }
}

/// Splits `state` into (session-scoped, user-scoped) entries.
pub fn split_state(state: SessionState) -> (SessionState, SessionState) {
    state
        .into_iter()
        .partition(|(key, _)| !key.starts_with(USER_PREFIX))
}

/// Overlays user-scoped entries on session-scoped ones.
pub fn merge_state(mut session_state: SessionState, user_state: SessionState) -> SessionState {
    session_state.extend(user_state);
    session_state
}
