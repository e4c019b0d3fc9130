//! Session storage using SQLite.
//!
//! Holds session-scoped state per session and user-scoped state per
//! (application, user). Values are JSON text; the encrypted refresh token is
//! stored exactly as handed over and read back unchanged.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{merge_state, split_state, Session, SessionState, SessionStore};

/// Session store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE sessions (
///     app_name TEXT NOT NULL,
///     user_id TEXT NOT NULL,
///     session_id TEXT NOT NULL,
///     state TEXT NOT NULL,          -- JSON object, session-scoped keys
///     created_at TEXT NOT NULL,     -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL,     -- ISO 8601 timestamp
///     PRIMARY KEY (app_name, user_id, session_id)
/// );
///
/// CREATE TABLE user_state (
///     app_name TEXT NOT NULL,
///     user_id TEXT NOT NULL,
///     key TEXT NOT NULL,            -- includes the "user:" prefix
///     value TEXT NOT NULL,          -- JSON value
///     updated_at TEXT NOT NULL,
///     PRIMARY KEY (app_name, user_id, key)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Session creation writes both tables in one transaction
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Creates or opens a session store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open session database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (app_name, user_id, session_id)
            );
            CREATE TABLE IF NOT EXISTS user_state (
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (app_name, user_id, key)
            );
            "#,
        )
        .context("Failed to create session tables")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Session database lock poisoned"))
    }

    fn load_user_state(conn: &Connection, app_name: &str, user_id: &str) -> Result<SessionState> {
        let mut stmt = conn
            .prepare("SELECT key, value FROM user_state WHERE app_name = ?1 AND user_id = ?2")
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![app_name, user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<(String, String)>, _>>()
            .context("Failed to read user state")?;

        rows.into_iter()
            .map(|(key, raw)| {
                let value: Value = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt user state value for key '{}'", key))?;
                Ok((key, value))
            })
            .collect()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: SessionState,
    ) -> Result<Session> {
        let (session_state, user_state) = split_state(state);
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_text = now.to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        for (key, value) in &user_state {
            tx.execute(
                r#"
                INSERT INTO user_state (app_name, user_id, key, value, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(app_name, user_id, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![app_name, user_id, key, value.to_string(), now_text],
            )
            .context("Failed to store user state")?;
        }

        tx.execute(
            r#"
            INSERT INTO sessions (app_name, user_id, session_id, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                app_name,
                user_id,
                session_id,
                Value::Object(session_state.clone()).to_string(),
                now_text,
                now_text,
            ],
        )
        .context("Failed to store session")?;

        tx.commit().context("Failed to commit session")?;

        let user_state = Self::load_user_state(&conn, app_name, user_id)?;

        tracing::debug!(session = %session_id, user = %user_id, "Created session");

        Ok(Session {
            id: session_id,
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state: merge_state(session_state, user_state),
            last_update_time: now,
        })
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>> {
        let conn = self.lock()?;

        let row: Option<(String, String)> = conn
            .query_row(
                r#"
                SELECT state, updated_at
                FROM sessions
                WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                "#,
                params![app_name, user_id, session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query session")?;

        let Some((raw_state, updated_at)) = row else {
            return Ok(None);
        };

        let session_state = match serde_json::from_str(&raw_state)
            .context("Corrupt session state")?
        {
            Value::Object(map) => map,
            _ => return Err(anyhow!("Session state is not a JSON object")),
        };

        let last_update_time = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse updated_at timestamp")?;

        let user_state = Self::load_user_state(&conn, app_name, user_id)?;

        Ok(Some(Session {
            id: session_id.to_string(),
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state: merge_state(session_state, user_state),
            last_update_time,
        }))
    }
}
