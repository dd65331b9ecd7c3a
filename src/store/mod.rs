//! Durable CRUD over canvas sessions, state snapshots, and the event log.
//!
//! Two conforming implementations coexist behind [`SessionStore`]: an
//! in-memory store for tests and single-process setups, and a SQLite store
//! for durability. Both return deep copies — mutating a returned value never
//! leaks back into the store — and both pass the same conformance suite.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

/// Fixed-precision RFC 3339 (microseconds, UTC) so that string order equals
/// chronological order — the SQL store compares timestamps as TEXT.
pub(crate) fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Clamp to the persisted precision so a value returned from a write equals
/// the same entity read back later.
pub(crate) fn clamp_ts(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .map_err(|e| crate::error::CanvasError::Internal(format!("bad timestamp {s:?}: {e}")))?;
    Ok(parsed.with_timezone(&Utc))
}

// ─── Entities ─────────────────────────────────────────────────────────────────

/// Identity for one canvas scope. `id` and `key` are both unique; `key` is
/// the external deduplication handle (workspace/channel/thread derived).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSession {
    pub id: String,
    pub key: String,
    pub workspace_id: Option<String>,
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation input: absent `id` is generated, absent timestamps are stamped.
#[derive(Debug, Clone, Default)]
pub struct NewCanvasSession {
    pub id: Option<String>,
    pub key: String,
    pub workspace_id: Option<String>,
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl NewCanvasSession {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// At most one snapshot per session; upsert replaces it atomically.
/// The payload is JSON by convention but opaque to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    pub session_id: String,
    pub state: Value,
    pub updated_at: DateTime<Utc>,
}

/// Append-only log entry, ordered within a session by `(created_at, id)`
/// with lexicographic `id` tiebreak. Ids are ULIDs, so the tiebreak follows
/// append order even for same-timestamp events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasEvent {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Append input: absent `id` gets a fresh ULID, absent `created_at` is stamped.
#[derive(Debug, Clone)]
pub struct NewCanvasEvent {
    pub id: Option<String>,
    pub session_id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewCanvasEvent {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            kind: kind.into(),
            payload,
            created_at: None,
        }
    }
}

/// Filter for [`SessionStore::list_events`]. `limit` of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

// ─── Contract ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails `AlreadyExists` on an `id` or `key` collision, `Invalid` on an
    /// empty key. Generates the id and stamps timestamps when absent.
    async fn create_session(&self, new: NewCanvasSession) -> Result<CanvasSession>;

    async fn get_session(&self, id: &str) -> Result<CanvasSession>;

    async fn get_session_by_key(&self, key: &str) -> Result<CanvasSession>;

    /// Preserves the prior key when the new one is empty; refuses a key held
    /// by a different session. `updated_at` is restamped, never moving
    /// backwards.
    async fn update_session(&self, session: CanvasSession) -> Result<CanvasSession>;

    /// Cascades to the session's state snapshot and event log.
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Requires the session to exist; replaces any prior snapshot atomically.
    async fn upsert_state(&self, state: CanvasState) -> Result<CanvasState>;

    async fn get_state(&self, session_id: &str) -> Result<CanvasState>;

    async fn delete_state(&self, session_id: &str) -> Result<()>;

    /// Requires the session to exist; generates the id and stamps
    /// `created_at` when absent.
    async fn append_event(&self, new: NewCanvasEvent) -> Result<CanvasEvent>;

    /// Events with `created_at >= since` (when given), ordered per the log
    /// contract, capped by `limit` (0 = unbounded). An unknown or empty
    /// session yields an empty list, not an error.
    async fn list_events(&self, session_id: &str, query: EventQuery) -> Result<Vec<CanvasEvent>>;

    /// Purges the session's log. `NotFound` only when the session itself is
    /// unknown; an existing-but-empty log purges successfully.
    async fn delete_events(&self, session_id: &str) -> Result<()>;
}

pub type SharedStore = Arc<dyn SessionStore>;

pub(crate) fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn generate_event_id() -> String {
    ulid::Ulid::new().to_string()
}
