//! Live-reload endpoints: the client script and the WebSocket feed.
//!
//! Each connected socket registers with the [`LiveReloadHub`]; the watcher's
//! notification turns into the literal text frame `reload` with a 2 s write
//! deadline. A client that misses the deadline or errors is dropped and
//! unregistered.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

use super::HostState;
use crate::watch::RELOAD_WRITE_DEADLINE;

/// Browser-side client: reconnecting WebSocket that reloads the page on the
/// `reload` frame. Served at `<namespace>/live.js`; derives the socket path
/// from its own script URL.
const LIVE_RELOAD_CLIENT_JS: &str = r#"(function () {
  "use strict";
  var script = document.currentScript;
  var wsPath = "/ws";
  if (script && script.src) {
    wsPath = new URL(script.src).pathname.replace(/\/live\.js$/, "/ws");
  }
  var proto = location.protocol === "https:" ? "wss:" : "ws:";
  function connect() {
    var ws = new WebSocket(proto + "//" + location.host + wsPath);
    ws.onmessage = function (ev) {
      if (ev.data === "reload") location.reload();
    };
    ws.onclose = function () {
      setTimeout(connect, 1000);
    };
  }
  connect();
})();
"#;

pub async fn live_js() -> Response {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        LIVE_RELOAD_CLIENT_JS,
    )
        .into_response()
}

pub async fn ws_upgrade(State(state): State<Arc<HostState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| live_reload_socket(state, socket))
}

async fn live_reload_socket(state: Arc<HostState>, mut socket: WebSocket) {
    let (id, mut reloads) = state.live.register();
    debug!(client = id, "live-reload client connected");

    loop {
        tokio::select! {
            notice = reloads.recv() => match notice {
                Some(()) => {
                    let send = socket.send(Message::Text("reload".into()));
                    match tokio::time::timeout(RELOAD_WRITE_DEADLINE, send).await {
                        Ok(Ok(())) => {}
                        // Write failure or missed deadline: drop this client.
                        _ => break,
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {} // clients send nothing meaningful
                _ => break,
            },
        }
    }

    state.live.unregister(id);
    debug!(client = id, "live-reload client disconnected");
}
