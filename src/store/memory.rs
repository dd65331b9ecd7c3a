//! In-memory session store.
//!
//! Plain maps behind a reader-writer mutex. No await happens while the lock
//! is held, and every returned entity is a deep copy, so callers can mutate
//! results freely without leaking changes back.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{
    clamp_ts, generate_event_id, generate_session_id, CanvasEvent, CanvasSession, CanvasState,
    EventQuery, NewCanvasEvent, NewCanvasSession, SessionStore,
};
use crate::error::{CanvasError, Result};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, CanvasSession>,
    /// key → session id
    by_key: HashMap<String, String>,
    states: HashMap<String, CanvasState>,
    events: HashMap<String, Vec<CanvasEvent>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
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

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.sessions.contains_key(&session.id) {
            return Err(CanvasError::AlreadyExists(format!(
                "session id {}",
                session.id
            )));
        }
        if inner.by_key.contains_key(&session.key) {
            return Err(CanvasError::AlreadyExists(format!(
                "session key {}",
                session.key
            )));
        }
        inner.by_key.insert(session.key.clone(), session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<CanvasSession> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| CanvasError::not_found(format!("session {id}")))
    }

    async fn get_session_by_key(&self, key: &str) -> Result<CanvasSession> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_key
            .get(key)
            .and_then(|id| inner.sessions.get(id))
            .cloned()
            .ok_or_else(|| CanvasError::not_found(format!("session key {key}")))
    }

    async fn update_session(&self, session: CanvasSession) -> Result<CanvasSession> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let prior = inner
            .sessions
            .get(&session.id)
            .cloned()
            .ok_or_else(|| CanvasError::not_found(format!("session {}", session.id)))?;

        let key = if session.key.is_empty() {
            prior.key.clone()
        } else {
            session.key.clone()
        };
        if let Some(holder) = inner.by_key.get(&key) {
            if holder != &session.id {
                return Err(CanvasError::AlreadyExists(format!("session key {key}")));
            }
        }

        let updated = CanvasSession {
            id: session.id,
            key: key.clone(),
            workspace_id: session.workspace_id,
            channel_id: session.channel_id,
            thread_id: session.thread_id,
            created_by: session.created_by,
            created_at: prior.created_at,
            updated_at: clamp_ts(Utc::now()).max(prior.updated_at),
        };

        inner.by_key.remove(&prior.key);
        inner.by_key.insert(key, updated.id.clone());
        inner.sessions.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let session = inner
            .sessions
            .remove(id)
            .ok_or_else(|| CanvasError::not_found(format!("session {id}")))?;
        inner.by_key.remove(&session.key);
        inner.states.remove(id);
        inner.events.remove(id);
        Ok(())
    }

    async fn upsert_state(&self, state: CanvasState) -> Result<CanvasState> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.sessions.contains_key(&state.session_id) {
            return Err(CanvasError::not_found(format!(
                "session {}",
                state.session_id
            )));
        }
        let stored = CanvasState {
            updated_at: clamp_ts(Utc::now()),
            ..state
        };
        inner
            .states
            .insert(stored.session_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_state(&self, session_id: &str) -> Result<CanvasState> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .states
            .get(session_id)
            .cloned()
            .ok_or_else(|| CanvasError::not_found(format!("state for session {session_id}")))
    }

    async fn delete_state(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .states
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| CanvasError::not_found(format!("state for session {session_id}")))
    }

    async fn append_event(&self, new: NewCanvasEvent) -> Result<CanvasEvent> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.sessions.contains_key(&new.session_id) {
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
        inner
            .events
            .entry(event.session_id.clone())
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, session_id: &str, query: EventQuery) -> Result<Vec<CanvasEvent>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(log) = inner.events.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<CanvasEvent> = log
            .iter()
            .filter(|e| query.since.map_or(true, |since| e.created_at >= since))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if query.limit > 0 {
            events.truncate(query.limit);
        }
        Ok(events)
    }

    async fn delete_events(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.sessions.contains_key(session_id) {
            return Err(CanvasError::not_found(format!("session {session_id}")));
        }
        inner.events.remove(session_id);
        Ok(())
    }
}
