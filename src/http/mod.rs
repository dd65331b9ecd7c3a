//! HTTP host for the canvas subsystem.
//!
//! Mounts, under the configured namespace prefix (default `/__nexus__`):
//!
//!   GET  /canvas/{path}        static files (session-aware, live-reload injection)
//!   GET  /canvas/api/stream    SSE stream (snapshot-then-tail)
//!   POST /canvas/api/action    action ingress
//!   GET  /a2ui/{path}          static files from the aux root
//!   GET  /live.js, GET /ws     live reload (only when enabled)
//!   GET  /healthz, /metrics    liveness + Prometheus text

pub mod action;
pub mod authz;
pub mod live;
pub mod static_files;
pub mod stream;
pub mod urls;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::CanvasConfig;
use crate::error::{CanvasError, Result};
use crate::files::FileResolver;
use crate::limiter::RateLimiter;
use crate::manager::SharedManager;
use crate::metrics::SharedMetrics;
use crate::watch::LiveReloadHub;

pub use action::{ActionHandler, CanvasAction};
pub use authz::{AuthService, AuthUser, SharedAuthService};
pub use urls::UrlRequest;

// ─── Error rendering ──────────────────────────────────────────────────────────

/// Newtype bridging the canvas error taxonomy onto HTTP responses with the
/// stable terse bodies.
pub struct HttpError(pub CanvasError);

impl From<CanvasError> for HttpError {
    fn from(e: CanvasError) -> Self {
        HttpError(e)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(err = %self.0, "request failed");
        } else {
            debug!(err = %self.0, status = status.as_u16(), "request rejected");
        }
        (status, self.0.public_message()).into_response()
    }
}

// ─── Host ─────────────────────────────────────────────────────────────────────

/// Shared state behind every route handler.
pub struct HostState {
    pub config: CanvasConfig,
    pub manager: SharedManager,
    pub resolver: FileResolver,
    pub limiter: RateLimiter,
    pub live: Arc<LiveReloadHub>,
    pub auth: Option<SharedAuthService>,
    pub action_handler: Option<ActionHandler>,
    pub metrics: Option<SharedMetrics>,
    pub started_at: Instant,
}

pub struct CanvasHost {
    state: Arc<HostState>,
}

impl CanvasHost {
    pub fn new(config: CanvasConfig, manager: SharedManager) -> Result<Self> {
        let mut resolver = FileResolver::new(
            &config.root,
            config.a2ui_root.as_deref(),
            config.auto_index,
        )?;
        if let Ok(store) = manager.store() {
            resolver = resolver.with_store(Arc::clone(store));
        }
        let limiter = RateLimiter::new(config.actions.rate_limit.clone());
        Ok(Self {
            state: Arc::new(HostState {
                resolver,
                limiter,
                live: Arc::new(LiveReloadHub::new()),
                auth: None,
                action_handler: None,
                metrics: None,
                started_at: Instant::now(),
                config,
                manager,
            }),
        })
    }

    fn state_mut(&mut self) -> &mut HostState {
        Arc::get_mut(&mut self.state).expect("host not yet shared")
    }

    /// Optional credential fallback for browser users without canvas tokens.
    pub fn with_auth_service(mut self, auth: SharedAuthService) -> Self {
        self.state_mut().auth = Some(auth);
        self
    }

    /// The single injected action callback. Multiple listeners are the
    /// caller's own fan-out function.
    pub fn with_action_handler(mut self, handler: ActionHandler) -> Self {
        self.state_mut().action_handler = Some(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.state_mut().metrics = Some(metrics);
        self
    }

    /// Registry the asset watcher notifies on changes.
    pub fn live_hub(&self) -> Arc<LiveReloadHub> {
        Arc::clone(&self.state.live)
    }

    pub fn config(&self) -> &CanvasConfig {
        &self.state.config
    }

    /// Browser URL for a session's canvas page.
    pub fn canvas_session_url(&self, req: &UrlRequest, session_id: &str) -> String {
        urls::canvas_session_url(&self.state.config, req, session_id)
    }

    /// Same, with a freshly minted access token appended as `?token=`.
    pub fn signed_session_url(
        &self,
        req: &UrlRequest,
        session_id: &str,
        role: &str,
        user_id: Option<String>,
    ) -> Result<String> {
        urls::signed_session_url(&self.state.config, req, session_id, role, user_id)
    }

    pub fn router(&self) -> Router {
        let state = Arc::clone(&self.state);
        let mut routes = Router::new()
            .route("/canvas", get(static_files::canvas_root_redirect))
            .route("/canvas/", get(static_files::serve_canvas_index))
            .route("/canvas/{*rest}", get(static_files::serve_canvas))
            .route("/canvas/api/stream", get(stream::stream))
            .route("/canvas/api/action", any(action::action_entry))
            .route("/a2ui/{*rest}", get(static_files::serve_aux))
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text));
        if state.config.live_reload {
            routes = routes
                .route("/live.js", get(live::live_js))
                .route("/ws", get(live::ws_upgrade));
        }

        let namespaced = if state.config.namespace.is_empty() {
            routes
        } else {
            Router::new().nest(&state.config.namespace, routes)
        };
        namespaced
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind `host:port` and serve until the process exits.
    pub async fn serve(self) -> anyhow::Result<()> {
        let bind = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        info!("canvas host listening on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ─── Liveness + metrics ───────────────────────────────────────────────────────

async fn healthz(State(state): State<Arc<HostState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics_text(State(state): State<Arc<HostState>>) -> Response {
    let body = match &state.metrics {
        Some(metrics) => metrics.render_prometheus(),
        None => String::new(),
    };
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
