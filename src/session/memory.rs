use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{merge_state, split_state, Session, SessionState, SessionStore};

/// (app, user, session id)
type SessionKey = (String, String, String);

/// (app, user)
type UserKey = (String, String);

/// In-memory session store. State is lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionKey, Session>,
    user_state: DashMap<UserKey, SessionState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_state_for(&self, app_name: &str, user_id: &str) -> SessionState {
        self.user_state
            .get(&(app_name.to_string(), user_id.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: SessionState,
    ) -> Result<Session> {
        let (session_state, user_state) = split_state(state);

        if !user_state.is_empty() {
            self.user_state
                .entry((app_name.to_string(), user_id.to_string()))
                .or_default()
                .extend(user_state);
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state: session_state,
            last_update_time: Utc::now(),
        };

        self.sessions.insert(
            (
                app_name.to_string(),
                user_id.to_string(),
                session.id.clone(),
            ),
            session.clone(),
        );

        tracing::debug!(session = %session.id, user = %user_id, "Created session");

        Ok(Session {
            state: merge_state(session.state, self.user_state_for(app_name, user_id)),
            ..session
        })
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>> {
        let key = (
            app_name.to_string(),
            user_id.to_string(),
            session_id.to_string(),
        );

        let Some(session) = self.sessions.get(&key).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };

        Ok(Some(Session {
            state: merge_state(session.state, self.user_state_for(app_name, user_id)),
            ..session
        }))
    }
}
