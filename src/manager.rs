//! Canvas manager — coordinates the store and the hub.
//!
//! Agent code talks to the manager: `push` appends to the event log and fans
//! out, `reset` replaces the state snapshot, `snapshot` reads both for the
//! stream's snapshot-then-tail handshake. Audit and metrics collaborators
//! are optional and no-op when absent; a missing store is `Unavailable`.

use serde_json::Value;
use std::sync::Arc;

use crate::audit::{AuditEntry, SharedAuditSink};
use crate::error::{CanvasError, Result};
use crate::hub::{Hub, StreamMessage};
use crate::metrics::SharedMetrics;
use crate::store::{CanvasEvent, CanvasState, EventQuery, NewCanvasEvent, SharedStore};

/// Ambient identity of the caller, propagated into audit entries and the
/// action handler. Cancellation is structural: dropping the future of any
/// manager operation abandons it.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub user_id: Option<String>,
}

impl CallContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

pub struct CanvasManager {
    store: Option<SharedStore>,
    hub: Hub,
    audit: Option<SharedAuditSink>,
    metrics: Option<SharedMetrics>,
}

impl CanvasManager {
    pub fn new(store: Option<SharedStore>) -> Self {
        Self {
            store,
            hub: Hub::new(),
            audit: None,
            metrics: None,
        }
    }

    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The configured store, or `Unavailable` when none is wired.
    pub fn store(&self) -> Result<&SharedStore> {
        self.store
            .as_ref()
            .ok_or(CanvasError::Unavailable("session store not configured"))
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    async fn record_audit(&self, kind: &str, session_id: &str, ctx: &CallContext) {
        if let Some(audit) = &self.audit {
            audit
                .record(AuditEntry::new(kind, session_id, ctx.user_id.clone()))
                .await;
        }
    }

    /// Append an `"event"` entry to the session's log and fan it out to
    /// every live subscriber.
    pub async fn push(
        &self,
        ctx: &CallContext,
        session_id: &str,
        payload: Value,
    ) -> Result<CanvasEvent> {
        let store = self.store()?;
        let event = store
            .append_event(NewCanvasEvent::new(session_id, "event", payload.clone()))
            .await?;

        self.record_audit("canvas.update", session_id, ctx).await;
        if let Some(metrics) = &self.metrics {
            metrics.inc_updates();
        }
        self.hub.broadcast(&StreamMessage::event(session_id, payload));
        Ok(event)
    }

    /// Replace the session's state snapshot and fan out a `"reset"`.
    ///
    /// The event log is not truncated: the stream's snapshot-then-tail
    /// handshake keeps late subscribers consistent.
    pub async fn reset(&self, ctx: &CallContext, session_id: &str, state: Value) -> Result<()> {
        let store = self.store()?;
        store
            .upsert_state(CanvasState {
                session_id: session_id.to_string(),
                state: state.clone(),
                updated_at: chrono::Utc::now(),
            })
            .await?;

        self.record_audit("canvas.reset", session_id, ctx).await;
        if let Some(metrics) = &self.metrics {
            metrics.inc_updates();
        }
        self.hub.broadcast(&StreamMessage::reset(session_id, state));
        Ok(())
    }

    /// Current `(state, events)` view of a session.
    ///
    /// An unknown session is `NotFound`; a known session without a snapshot
    /// yields `None` state with whatever events exist.
    pub async fn snapshot(&self, session_id: &str) -> Result<(Option<Value>, Vec<CanvasEvent>)> {
        let store = self.store()?;
        store.get_session(session_id).await?;

        let state = match store.get_state(session_id).await {
            Ok(s) => Some(s.state),
            Err(CanvasError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let events = store.list_events(session_id, EventQuery::default()).await?;
        Ok((state, events))
    }
}

/// Shared handle passed to the HTTP host and agent integration code.
pub type SharedManager = Arc<CanvasManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{memory::MemoryStore, NewCanvasSession, SessionStore};
    use serde_json::json;

    async fn manager_with_session(session_key: &str) -> (CanvasManager, String) {
        let store = Arc::new(MemoryStore::new());
        let session = store
            .create_session(NewCanvasSession::with_key(session_key))
            .await
            .unwrap();
        (CanvasManager::new(Some(store)), session.id)
    }

    #[tokio::test]
    async fn push_appends_and_broadcasts() {
        let (manager, sid) = manager_with_session("k1").await;
        let (mut rx, _sub) = manager.hub().subscribe(&sid);

        manager
            .push(&CallContext::anonymous(), &sid, json!({"hello": true}))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind, "event");
        assert_eq!(msg.payload, json!({"hello": true}));

        let (_, events) = manager.snapshot(&sid).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "event");
    }

    #[tokio::test]
    async fn reset_replaces_state_without_truncating_log() {
        let (manager, sid) = manager_with_session("k1").await;
        let ctx = CallContext::for_user("u1");

        manager.push(&ctx, &sid, json!(1)).await.unwrap();
        manager.reset(&ctx, &sid, json!({"v": 2})).await.unwrap();

        let (state, events) = manager.snapshot(&sid).await.unwrap();
        assert_eq!(state, Some(json!({"v": 2})));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_of_unknown_session_is_not_found() {
        let (manager, _) = manager_with_session("k1").await;
        assert!(matches!(
            manager.snapshot("nope").await,
            Err(CanvasError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_store_is_unavailable() {
        let manager = CanvasManager::new(None);
        assert!(matches!(
            manager.push(&CallContext::anonymous(), "s", json!(1)).await,
            Err(CanvasError::Unavailable(_))
        ));
    }
}
