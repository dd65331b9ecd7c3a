//! Server-Sent Events stream: snapshot, then tail.
//!
//! The handler authorizes the request, emits the current state snapshot (if
//! any) as a single `type:"state"` frame, and only then subscribes to the
//! hub. Snapshot-then-subscribe means a very fresh event can overlap the
//! snapshot; UI payloads are idempotent to absorb that. Subscribing first
//! would instead risk duplicates of a different kind, and snapshotting after
//! subscribing would risk gaps.
//!
//! Request cancellation drops the stream, which drops the hub subscription
//! and the viewer-gauge guard.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use super::authz::authorize_session_request;
use super::{HostState, HttpError};
use crate::error::CanvasError;
use crate::files::is_valid_session_id;
use crate::hub::StreamMessage;
use crate::metrics::SharedMetrics;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub session: Option<String>,
    pub token: Option<String>,
}

/// RAII guard for the `active_viewers` gauge.
struct ViewerGuard {
    metrics: Option<SharedMetrics>,
}

impl ViewerGuard {
    fn new(metrics: Option<SharedMetrics>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.viewer_connected();
        }
        Self { metrics }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.viewer_disconnected();
        }
    }
}

fn sse_frame(msg: &StreamMessage) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(msg).unwrap_or_default()))
}

pub async fn stream(
    State(state): State<Arc<HostState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let session_id = query
        .session
        .filter(|s| is_valid_session_id(s))
        .ok_or_else(|| CanvasError::invalid("missing or invalid session parameter"))?;

    authorize_session_request(&state, &headers, query.token.as_deref(), &session_id).await?;

    let store = state.manager.store()?;
    let snapshot = match store.get_state(&session_id).await {
        Ok(s) => Some(s.state),
        Err(CanvasError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    // Snapshot first, subscribe second (see module docs for the overlap).
    let initial = snapshot.map(|s| StreamMessage::state(&session_id, s));
    let (rx, subscription) = state.manager.hub().subscribe(&session_id);
    let viewers = ViewerGuard::new(state.metrics.clone());

    let head = stream::iter(initial.iter().map(sse_frame).collect::<Vec<_>>());
    let tail = stream::unfold(
        (rx, subscription, viewers),
        |(mut rx, subscription, viewers)| async move {
            rx.recv()
                .await
                .map(|msg| (sse_frame(&msg), (rx, subscription, viewers)))
        },
    );

    let sse = Sse::new(head.chain(tail)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    );
    Ok((
        [
            ("Cache-Control", "no-cache"),
            ("X-Accel-Buffering", "no"),
        ],
        sse,
    ))
}
