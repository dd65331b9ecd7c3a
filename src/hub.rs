//! Per-session publish/subscribe fan-out of stream messages.
//!
//! The hub maps a session id to its set of subscriber queues. Broadcasting
//! performs a non-blocking send to every queue: a saturated subscriber drops
//! that one message, never delaying the broadcaster or its neighbors. The
//! hub does not evict slow subscribers — the HTTP layer terminates them
//! through its own keepalive discipline.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

/// Bounded depth of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

/// Envelope pushed to every stream subscriber of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub payload: Value,
    /// RFC 3339 with nanoseconds.
    pub ts: String,
}

impl StreamMessage {
    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn event(session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: "event".to_string(),
            session_id: session_id.into(),
            payload,
            ts: Self::now(),
        }
    }

    pub fn reset(session_id: impl Into<String>, state: Value) -> Self {
        Self {
            kind: "reset".to_string(),
            session_id: session_id.into(),
            payload: state,
            ts: Self::now(),
        }
    }

    pub fn state(session_id: impl Into<String>, state: Value) -> Self {
        Self {
            kind: "state".to_string(),
            session_id: session_id.into(),
            payload: state,
            ts: Self::now(),
        }
    }
}

type Registry = HashMap<String, HashMap<u64, mpsc::Sender<StreamMessage>>>;

#[derive(Default)]
struct HubInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

/// Cheaply clonable handle to the per-session subscriber registry.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `session_id`.
    ///
    /// Returns the bounded receive queue and an RAII handle whose drop
    /// removes the subscriber and closes the queue exactly once.
    pub fn subscribe(&self, session_id: &str) -> (mpsc::Receiver<StreamMessage>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(|e| e.into_inner());
            registry
                .entry(session_id.to_string())
                .or_default()
                .insert(id, tx);
        }
        let sub = Subscription {
            hub: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            id,
        };
        (rx, sub)
    }

    /// Fan `msg` out to every subscriber of its session.
    ///
    /// The send is non-blocking under the registry read lock: a full queue
    /// drops the message for that subscriber only. Returns the number of
    /// queues the message was delivered to.
    pub fn broadcast(&self, msg: &StreamMessage) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = registry.get(&msg.session_id) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, tx) in subs {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(session_id = %msg.session_id, subscriber = id, "queue full — dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Current number of subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.get(session_id).map_or(0, HashMap::len)
    }
}

/// Cancellation handle for one subscriber. Dropping it unregisters the
/// queue; removal takes the registry write lock, so it never interleaves
/// with a broadcast servicing the same subscriber.
pub struct Subscription {
    hub: Arc<HubInner>,
    session_id: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.hub.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = registry.get_mut(&self.session_id) {
            subs.remove(&self.id);
            if subs.is_empty() {
                registry.remove(&self.session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers_once() {
        let hub = Hub::new();
        let (mut rx1, _s1) = hub.subscribe("sess-a");
        let (mut rx2, _s2) = hub.subscribe("sess-a");

        let delivered = hub.broadcast(&StreamMessage::event("sess-a", json!({"n": 1})));
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap().payload, json!({"n": 1}));
        assert_eq!(rx2.recv().await.unwrap().payload, json!({"n": 1}));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_is_session_scoped() {
        let hub = Hub::new();
        let (mut rx_a, _sa) = hub.subscribe("sess-a");
        let (mut rx_b, _sb) = hub.subscribe("sess-b");

        hub.broadcast(&StreamMessage::event("sess-a", json!(1)));
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn saturated_subscriber_drops_without_blocking_others() {
        let hub = Hub::new();
        let (mut fast, _sf) = hub.subscribe("sess-a");
        let (_slow_rx, _ss) = hub.subscribe("sess-a");

        // Saturate the slow subscriber's queue (we never drain _slow_rx),
        // then one more: the slow queue drops it, the fast one still gets it.
        for i in 0..SUBSCRIBER_QUEUE_CAPACITY {
            hub.broadcast(&StreamMessage::event("sess-a", json!(i)));
            assert!(fast.recv().await.is_some());
        }
        let delivered = hub.broadcast(&StreamMessage::event("sess-a", json!("tail")));
        assert_eq!(delivered, 1);
        assert_eq!(fast.recv().await.unwrap().payload, json!("tail"));
    }

    #[tokio::test]
    async fn drop_unregisters_and_closes_queue() {
        let hub = Hub::new();
        let (mut rx, sub) = hub.subscribe("sess-a");
        assert_eq!(hub.subscriber_count("sess-a"), 1);

        drop(sub);
        assert_eq!(hub.subscriber_count("sess-a"), 0);
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.broadcast(&StreamMessage::event("sess-a", json!(1))), 0);
    }

    #[test]
    fn stream_message_wire_shape() {
        let msg = StreamMessage::event("sess-a", json!({"hello": true}));
        let value: Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["session_id"], "sess-a");
        assert_eq!(value["payload"], json!({"hello": true}));
        assert!(value["ts"].as_str().unwrap().contains('T'));
    }
}
