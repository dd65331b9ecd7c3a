//! SQLite session store.
//!
//! WAL journal mode, parameterized statements throughout. Timestamps are
//! fixed-precision RFC 3339 TEXT, so `ORDER BY created_at, id` and the
//! `since` filter compare correctly as strings. Unique-constraint violations
//! map to `AlreadyExists`; everything else infrastructural surfaces as
//! `Backend` unchanged.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use super::{
    clamp_ts, format_ts, generate_event_id, generate_session_id, parse_ts, CanvasEvent,
    CanvasSession, CanvasState, EventQuery, NewCanvasEvent, NewCanvasSession, SessionStore,
};
use crate::error::{CanvasError, Result};

#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    key: String,
    workspace_id: Option<String>,
    channel_id: Option<String>,
    thread_id: Option<String>,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<CanvasSession> {
        Ok(CanvasSession {
            id: self.id,
            key: self.key,
            workspace_id: self.workspace_id,
            channel_id: self.channel_id,
            thread_id: self.thread_id,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StateRow {
    session_id: String,
    state_json: String,
    updated_at: String,
}

impl StateRow {
    fn into_state(self) -> Result<CanvasState> {
        Ok(CanvasState {
            state: serde_json::from_str(&self.state_json)
                .map_err(|e| CanvasError::Internal(format!("corrupt state_json: {e}")))?,
            session_id: self.session_id,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRow {
    id: String,
    session_id: String,
    kind: String,
    payload_json: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<CanvasEvent> {
        Ok(CanvasEvent {
            payload: serde_json::from_str(&self.payload_json)
                .map_err(|e| CanvasError::Internal(format!("corrupt payload_json: {e}")))?,
            id: self.id,
            session_id: self.session_id,
            kind: self.kind,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn map_db_err(e: sqlx::Error, what: &str) -> CanvasError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return CanvasError::AlreadyExists(what.to_string());
        }
    }
    CanvasError::Backend(e.into())
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) `{data_dir}/canvas.db`.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        let db_path = data_dir.join("canvas.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(|e| CanvasError::Backend(e.into()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database — a single pooled connection, since each
    /// SQLite `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt)
                        .execute(pool)
                        .await
                        .map_err(|e| CanvasError::Backend(e.into()))?;
                }
            }
        }
        Ok(())
    }

    async fn session_exists(&self, id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM canvas_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, new: NewCanvasSession) -> Result<CanvasSession> {
        if new.key.is_empty() {
            return Err(CanvasError::invalid("session key is required"));
        }
        let now = Utc::now();
        let session = CanvasSession {
            id: new.id.unwrap_or_else(generate_session_id),
            key: new.key,
            workspace_id: new.workspace_id,
            channel_id: new.channel_id,
            thread_id: new.thread_id,
            created_by: new.created_by,
            created_at: clamp_ts(new.created_at.unwrap_or(now)),
            updated_at: clamp_ts(new.updated_at.unwrap_or(now)),
        };

        sqlx::query(
            "INSERT INTO canvas_sessions \
             (id, key, workspace_id, channel_id, thread_id, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.key)
        .bind(&session.workspace_id)
        .bind(&session.channel_id)
        .bind(&session.thread_id)
        .bind(&session.created_by)
        .bind(format_ts(session.created_at))
        .bind(format_ts(session.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "session id or key"))?;

        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<CanvasSession> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM canvas_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        row.ok_or_else(|| CanvasError::not_found(format!("session {id}")))?
            .into_session()
    }

    async fn get_session_by_key(&self, key: &str) -> Result<CanvasSession> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM canvas_sessions WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        row.ok_or_else(|| CanvasError::not_found(format!("session key {key}")))?
            .into_session()
    }

    async fn update_session(&self, session: CanvasSession) -> Result<CanvasSession> {
        let prior = self.get_session(&session.id).await?;
        let key = if session.key.is_empty() {
            prior.key.clone()
        } else {
            session.key.clone()
        };

        let holder: Option<(String,)> =
            sqlx::query_as("SELECT id FROM canvas_sessions WHERE key = ? AND id != ?")
                .bind(&key)
                .bind(&session.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CanvasError::Backend(e.into()))?;
        if holder.is_some() {
            return Err(CanvasError::AlreadyExists(format!("session key {key}")));
        }

        let updated = CanvasSession {
            id: session.id,
            key,
            workspace_id: session.workspace_id,
            channel_id: session.channel_id,
            thread_id: session.thread_id,
            created_by: session.created_by,
            created_at: prior.created_at,
            updated_at: clamp_ts(Utc::now()).max(prior.updated_at),
        };

        sqlx::query(
            "UPDATE canvas_sessions SET key = ?, workspace_id = ?, channel_id = ?, \
             thread_id = ?, created_by = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&updated.key)
        .bind(&updated.workspace_id)
        .bind(&updated.channel_id)
        .bind(&updated.thread_id)
        .bind(&updated.created_by)
        .bind(format_ts(updated.updated_at))
        .bind(&updated.id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "session key"))?;

        Ok(updated)
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        sqlx::query("DELETE FROM canvas_events WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        sqlx::query("DELETE FROM canvas_states WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        let result = sqlx::query("DELETE FROM canvas_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        tx.commit()
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(CanvasError::not_found(format!("session {id}")));
        }
        Ok(())
    }

    async fn upsert_state(&self, state: CanvasState) -> Result<CanvasState> {
        if !self.session_exists(&state.session_id).await? {
            return Err(CanvasError::not_found(format!(
                "session {}",
                state.session_id
            )));
        }
        let stored = CanvasState {
            updated_at: clamp_ts(Utc::now()),
            ..state
        };
        sqlx::query(
            "INSERT INTO canvas_states (session_id, state_json, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
               state_json = excluded.state_json, \
               updated_at = excluded.updated_at",
        )
        .bind(&stored.session_id)
        .bind(stored.state.to_string())
        .bind(format_ts(stored.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| CanvasError::Backend(e.into()))?;
        Ok(stored)
    }

    async fn get_state(&self, session_id: &str) -> Result<CanvasState> {
        let row: Option<StateRow> =
            sqlx::query_as("SELECT * FROM canvas_states WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CanvasError::Backend(e.into()))?;
        row.ok_or_else(|| CanvasError::not_found(format!("state for session {session_id}")))?
            .into_state()
    }

    async fn delete_state(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM canvas_states WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(CanvasError::not_found(format!(
                "state for session {session_id}"
            )));
        }
        Ok(())
    }

    async fn append_event(&self, new: NewCanvasEvent) -> Result<CanvasEvent> {
        if !self.session_exists(&new.session_id).await? {
            return Err(CanvasError::not_found(format!(
                "session {}",
                new.session_id
            )));
        }
        let event = CanvasEvent {
            id: new.id.unwrap_or_else(generate_event_id),
            session_id: new.session_id,
            kind: new.kind,
            payload: new.payload,
            created_at: clamp_ts(new.created_at.unwrap_or_else(Utc::now)),
        };
        sqlx::query(
            "INSERT INTO canvas_events (id, session_id, kind, payload_json, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(&event.kind)
        .bind(event.payload.to_string())
        .bind(format_ts(event.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "event id"))?;
        Ok(event)
    }

    async fn list_events(&self, session_id: &str, query: EventQuery) -> Result<Vec<CanvasEvent>> {
        let rows: Vec<EventRow> = match (query.since, query.limit) {
            (Some(since), 0) => {
                sqlx::query_as(
                    "SELECT * FROM canvas_events WHERE session_id = ? AND created_at >= ? \
                     ORDER BY created_at ASC, id ASC",
                )
                .bind(session_id)
                .bind(format_ts(since))
                .fetch_all(&self.pool)
                .await
            }
            (Some(since), limit) => {
                sqlx::query_as(
                    "SELECT * FROM canvas_events WHERE session_id = ? AND created_at >= ? \
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(session_id)
                .bind(format_ts(since))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            (None, 0) => {
                sqlx::query_as(
                    "SELECT * FROM canvas_events WHERE session_id = ? \
                     ORDER BY created_at ASC, id ASC",
                )
                .bind(session_id)
                .fetch_all(&self.pool)
                .await
            }
            (None, limit) => {
                sqlx::query_as(
                    "SELECT * FROM canvas_events WHERE session_id = ? \
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(session_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| CanvasError::Backend(e.into()))?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn delete_events(&self, session_id: &str) -> Result<()> {
        if !self.session_exists(session_id).await? {
            return Err(CanvasError::not_found(format!("session {session_id}")));
        }
        sqlx::query("DELETE FROM canvas_events WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CanvasError::Backend(e.into()))?;
        Ok(())
    }
}
