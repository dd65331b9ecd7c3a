//! Action ingress: `POST /canvas/api/action`.
//!
//! Pipeline per request: method gate, handler presence, 1 MiB body cap,
//! JSON decode + grammar checks, authorization, role gate (viewer is
//! read-only), token-bucket admission, then hand-off to the injected agent
//! callback. Handler failures log and report 500 without disturbing other
//! clients.

use axum::extract::{Query, State};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use super::authz::authorize_session_request;
use super::stream::StreamQuery;
use super::{HostState, HttpError};
use crate::error::CanvasError;
use crate::files::is_valid_session_id;
use crate::manager::CallContext;

/// Hard cap on the action request body.
pub const MAX_ACTION_BODY_BYTES: usize = 1024 * 1024;

/// UI-originated call routed to the agent runtime. `received_at` is
/// server-assigned; everything else crosses the wire.
#[derive(Debug, Clone)]
pub struct CanvasAction {
    pub session_id: String,
    pub id: Option<String>,
    pub name: String,
    pub source_component_id: Option<String>,
    pub context: Value,
    pub user_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// The single injected agent callback. Multiple listeners are expressed by
/// a caller-supplied fan-out function.
pub type ActionHandler =
    Arc<dyn Fn(CallContext, CanvasAction) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct ActionRequest {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    source_component_id: Option<String>,
    #[serde(default)]
    context: Value,
    #[serde(default)]
    user_id: Option<String>,
}

pub async fn action_entry(
    State(state): State<Arc<HostState>>,
    req: Request<axum::body::Body>,
) -> Response {
    if req.method() != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }
    match handle_action(state, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_action(
    state: Arc<HostState>,
    req: Request<axum::body::Body>,
) -> Result<Response, HttpError> {
    let handler = state
        .action_handler
        .clone()
        .ok_or(CanvasError::Unavailable("no action handler registered"))?;

    let (parts, body) = req.into_parts();
    if let Some(len) = parts
        .headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if len > MAX_ACTION_BODY_BYTES {
            return Err(CanvasError::TooLarge.into());
        }
    }
    let bytes = axum::body::to_bytes(body, MAX_ACTION_BODY_BYTES)
        .await
        .map_err(|_| CanvasError::TooLarge)?;

    let request: ActionRequest = serde_json::from_slice(&bytes)
        .map_err(|e| CanvasError::invalid(format!("malformed action body: {e}")))?;
    if request.name.trim().is_empty() {
        return Err(CanvasError::invalid("action name is required").into());
    }
    if !is_valid_session_id(&request.session_id) {
        return Err(CanvasError::invalid("missing or invalid session_id").into());
    }

    let query_token = Query::<StreamQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|q| q.0.token);
    let authz = authorize_session_request(
        &state,
        &parts.headers,
        query_token.as_deref(),
        &request.session_id,
    )
    .await?;

    let role = authz.effective_role(&state.config.actions.default_role);
    if !role.allows_action() {
        return Err(CanvasError::Forbidden.into());
    }

    let limit_key = match &authz.user_id {
        Some(user) => format!("{}:{}", request.session_id, user),
        None => request.session_id.clone(),
    };
    if !state.limiter.allow(&limit_key) {
        return Err(CanvasError::RateLimited.into());
    }

    if let Some(metrics) = &state.metrics {
        metrics.inc_actions();
    }

    let action = CanvasAction {
        session_id: request.session_id,
        id: request.id,
        name: request.name,
        source_component_id: request.source_component_id,
        context: request.context,
        user_id: request.user_id,
        received_at: Utc::now(),
    };
    let ctx = CallContext {
        user_id: authz.user_id,
    };
    handler(ctx, action).await.map_err(|e| {
        error!(err = %e, "action handler failed");
        CanvasError::Internal(format!("action handler: {e}"))
    })?;

    Ok((StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response())
}
