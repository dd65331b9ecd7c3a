//! End-to-end tests for the canvas HTTP host against a real listener.

use canvasd::config::{CanvasConfig, CliOverrides};
use canvasd::http::{ActionHandler, CanvasHost, UrlRequest};
use canvasd::manager::{CallContext, CanvasManager, SharedManager};
use canvasd::metrics::CanvasMetrics;
use canvasd::store::{memory::MemoryStore, NewCanvasSession, SessionStore};
use canvasd::token::{self, AccessToken};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "s3cret";
const NS: &str = "/__nexus__";

struct TestHost {
    addr: SocketAddr,
    manager: SharedManager,
    handler_calls: Arc<AtomicUsize>,
    metrics: Arc<CanvasMetrics>,
    // Keeps the asset root alive for the server's lifetime.
    _root: tempfile::TempDir,
    _data: tempfile::TempDir,
}

impl TestHost {
    fn url(&self, path: &str) -> String {
        format!("http://{}{NS}{path}", self.addr)
    }
}

fn counting_handler(calls: Arc<AtomicUsize>) -> ActionHandler {
    Arc::new(move |_ctx, _action| {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

/// Spin up a host on an ephemeral port. `configure` tweaks the resolved
/// config before the host is built; `wire_handler` controls whether an
/// action handler is registered.
async fn spawn_host(
    configure: impl FnOnce(&mut CanvasConfig),
    wire_handler: bool,
) -> TestHost {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), "<html><body>hi</body></html>").unwrap();
    let data = tempfile::tempdir().unwrap();

    let mut config = CanvasConfig::load(
        data.path().to_path_buf(),
        CliOverrides {
            root: Some(root.path().to_path_buf()),
            ..Default::default()
        },
    )
    .unwrap();
    config.tokens.secret = SECRET.to_string();
    config.tokens.ttl = Duration::from_secs(3600);
    configure(&mut config);

    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(CanvasMetrics::new());
    let manager: SharedManager = Arc::new(
        CanvasManager::new(Some(store)).with_metrics(Arc::clone(&metrics)),
    );

    let handler_calls = Arc::new(AtomicUsize::new(0));
    let mut host = CanvasHost::new(config, Arc::clone(&manager))
        .unwrap()
        .with_metrics(Arc::clone(&metrics));
    if wire_handler {
        host = host.with_action_handler(counting_handler(Arc::clone(&handler_calls)));
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = host.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestHost {
        addr,
        manager,
        handler_calls,
        metrics,
        _root: root,
        _data: data,
    }
}

async fn create_session(host: &TestHost, id: &str) {
    host.manager
        .store()
        .unwrap()
        .create_session(NewCanvasSession {
            id: Some(id.to_string()),
            ..NewCanvasSession::with_key(format!("key-{id}"))
        })
        .await
        .unwrap();
}

fn mint(session_id: &str, role: &str) -> String {
    let claims = AccessToken::new(
        session_id,
        None,
        Some(role.to_string()),
        Duration::from_secs(3600),
    );
    token::sign(SECRET, &claims).unwrap()
}

/// Pull the next `data:` payload off an SSE byte stream, skipping comments.
async fn next_sse_data<S, B, E>(stream: &mut S, buf: &mut String) -> Option<String>
where
    S: futures_util::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        while let Some(pos) = buf.find("\n\n") {
            let frame: String = buf.drain(..pos + 2).collect();
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|l| l.strip_prefix("data: "))
                .collect();
            if !data.is_empty() {
                return Some(data.join("\n"));
            }
        }
        match stream.next().await {
            Some(Ok(bytes)) => buf.push_str(&String::from_utf8_lossy(bytes.as_ref())),
            _ => return None,
        }
    }
}

// ─── Stream ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_snapshot_then_tail() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-A").await;
    host.manager
        .reset(&CallContext::anonymous(), "sess-A", json!({"v": 1}))
        .await
        .unwrap();

    let url = format!(
        "{}?session=sess-A&token={}",
        host.url("/canvas/api/stream"),
        mint("sess-A", "editor")
    );
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();

    let first: Value =
        serde_json::from_str(&next_sse_data(&mut stream, &mut buf).await.unwrap()).unwrap();
    assert_eq!(first["type"], "state");
    assert_eq!(first["session_id"], "sess-A");
    assert_eq!(first["payload"], json!({"v": 1}));

    host.manager
        .push(&CallContext::anonymous(), "sess-A", json!({"hello": true}))
        .await
        .unwrap();

    let second: Value = serde_json::from_str(
        &tokio::time::timeout(Duration::from_secs(5), next_sse_data(&mut stream, &mut buf))
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(second["type"], "event");
    assert_eq!(second["payload"], json!({"hello": true}));

    assert_eq!(host.metrics.active_viewers(), 1);
}

#[tokio::test]
async fn stream_without_snapshot_tails_only() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-B").await;

    let url = format!(
        "{}?session=sess-B&token={}",
        host.url("/canvas/api/stream"),
        mint("sess-B", "viewer")
    );
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    let mut stream = resp.bytes_stream();
    let mut buf = String::new();

    host.manager
        .push(&CallContext::anonymous(), "sess-B", json!(7))
        .await
        .unwrap();
    let first: Value = serde_json::from_str(
        &tokio::time::timeout(Duration::from_secs(5), next_sse_data(&mut stream, &mut buf))
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(first["type"], "event");
    assert_eq!(first["payload"], json!(7));
}

#[tokio::test]
async fn stream_auth_failures() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-A").await;

    // No token.
    let resp = reqwest::get(format!("{}?session=sess-A", host.url("/canvas/api/stream")))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "Unauthorized");

    // Expired token.
    let expired = token::sign(
        SECRET,
        &AccessToken {
            session_id: "sess-A".to_string(),
            user_id: None,
            role: Some("editor".to_string()),
            expires_at: Utc::now().timestamp() - 10,
        },
    )
    .unwrap();
    let resp = reqwest::get(format!(
        "{}?session=sess-A&token={expired}",
        host.url("/canvas/api/stream")
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "Token expired");

    // Token bound to a different session.
    let resp = reqwest::get(format!(
        "{}?session=sess-A&token={}",
        host.url("/canvas/api/stream"),
        mint("sess-Z", "editor")
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 401);

    // Missing session parameter.
    let resp = reqwest::get(host.url("/canvas/api/stream")).await.unwrap();
    assert_eq!(resp.status(), 400);
}

// ─── Actions ──────────────────────────────────────────────────────────────────

fn action_body(session_id: &str) -> Value {
    json!({"session_id": session_id, "name": "click"})
}

#[tokio::test]
async fn viewer_cannot_act() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-B").await;

    let resp = reqwest::Client::new()
        .post(host.url("/canvas/api/action"))
        .header("x-canvas-token", mint("sess-B", "viewer"))
        .json(&action_body("sess-B"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(host.handler_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn editor_action_accepted() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-B").await;

    let resp = reqwest::Client::new()
        .post(host.url("/canvas/api/action"))
        .header("authorization", format!("Bearer {}", mint("sess-B", "editor")))
        .json(&json!({
            "session_id": "sess-B",
            "name": "click",
            "source_component_id": "button-1",
            "context": {"x": 3},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"ok": true}));
    assert_eq!(host.handler_calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.metrics.actions_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn rate_limited_action() {
    let host = spawn_host(
        |cfg| {
            cfg.actions.rate_limit.enabled = true;
            cfg.actions.rate_limit.requests_per_second = 1.0;
            cfg.actions.rate_limit.burst_size = 1;
        },
        true,
    )
    .await;
    create_session(&host, "sess-R").await;

    let client = reqwest::Client::new();
    let send = || {
        client
            .post(host.url("/canvas/api/action"))
            .header("x-canvas-token", mint("sess-R", "editor"))
            .json(&action_body("sess-R"))
            .send()
    };
    assert_eq!(send().await.unwrap().status(), 202);
    assert_eq!(send().await.unwrap().status(), 429);
    assert_eq!(host.handler_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn action_method_and_wiring_gates() {
    let host = spawn_host(|_| {}, true).await;
    let resp = reqwest::get(host.url("/canvas/api/action")).await.unwrap();
    assert_eq!(resp.status(), 405);
    assert_eq!(resp.text().await.unwrap(), "Method Not Allowed");

    let unwired = spawn_host(|_| {}, false).await;
    let resp = reqwest::Client::new()
        .post(unwired.url("/canvas/api/action"))
        .json(&action_body("sess-X"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn action_body_validation() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-V").await;
    let client = reqwest::Client::new();
    let token = mint("sess-V", "editor");

    // Unparsable body.
    let resp = client
        .post(host.url("/canvas/api/action"))
        .header("x-canvas-token", &token)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Missing name.
    let resp = client
        .post(host.url("/canvas/api/action"))
        .header("x-canvas-token", &token)
        .json(&json!({"session_id": "sess-V"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Session id outside the grammar.
    let resp = client
        .post(host.url("/canvas/api/action"))
        .header("x-canvas-token", &token)
        .json(&json!({"session_id": "a/b", "name": "click"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(host.handler_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversize_body_is_413() {
    let host = spawn_host(|_| {}, true).await;
    let resp = reqwest::Client::new()
        .post(host.url("/canvas/api/action"))
        .body(vec![b'x'; 1024 * 1024 + 1])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
}

#[tokio::test]
async fn default_role_applies_without_token() {
    // Token verification disabled, no auth service: open access; the
    // configured default role gates actions.
    let viewer_host = spawn_host(
        |cfg| {
            cfg.tokens.secret = String::new();
        },
        true,
    )
    .await;
    create_session(&viewer_host, "sess-D").await;
    let resp = reqwest::Client::new()
        .post(viewer_host.url("/canvas/api/action"))
        .json(&action_body("sess-D"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let editor_host = spawn_host(
        |cfg| {
            cfg.tokens.secret = String::new();
            cfg.actions.default_role = "editor".to_string();
        },
        true,
    )
    .await;
    create_session(&editor_host, "sess-D").await;
    let resp = reqwest::Client::new()
        .post(editor_host.url("/canvas/api/action"))
        .json(&action_body("sess-D"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
}

// ─── Static files ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn canvas_root_redirects_to_trailing_slash() {
    let host = spawn_host(|_| {}, true).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let resp = client.get(host.url("/canvas")).send().await.unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        &format!("{NS}/canvas/")
    );
}

#[tokio::test]
async fn serves_index_with_live_reload_injection() {
    let host = spawn_host(
        |cfg| {
            cfg.live_reload = true;
            cfg.inject_client = true;
        },
        true,
    )
    .await;

    let resp = reqwest::get(host.url("/canvas/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains(&format!("<script src=\"{NS}/live.js\"></script></body>")));

    let js = reqwest::get(host.url("/live.js")).await.unwrap();
    assert_eq!(js.status(), 200);
    assert!(js.text().await.unwrap().contains("WebSocket"));
}

#[tokio::test]
async fn no_injection_when_live_reload_off() {
    let host = spawn_host(|_| {}, true).await;
    let body = reqwest::get(host.url("/canvas/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!body.contains("live.js"));

    // Live endpoints are not mounted at all.
    let resp = reqwest::get(host.url("/live.js")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn path_traversal_refused_over_the_wire() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let host = spawn_host(|_| {}, true).await;
    // Raw request: clients that do not normalize dot segments must still be
    // refused by the resolver, with no read above the root.
    let mut conn = tokio::net::TcpStream::connect(host.addr).await.unwrap();
    conn.write_all(
        format!("GET {NS}/canvas/../../etc/hosts HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .as_bytes(),
    )
    .await
    .unwrap();
    let mut response = String::new();
    conn.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_inside_root_is_404() {
    let host = spawn_host(|_| {}, true).await;
    std::os::unix::fs::symlink("/etc/passwd", host._root.path().join("leak.html")).unwrap();
    let resp = reqwest::get(host.url("/canvas/leak.html")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn session_scoped_static_serving() {
    let host = spawn_host(|_| {}, true).await;
    create_session(&host, "sess-S").await;
    std::fs::create_dir(host._root.path().join("sess-S")).unwrap();
    std::fs::write(
        host._root.path().join("sess-S/index.html"),
        "<html>scoped</html>",
    )
    .unwrap();

    let body = reqwest::get(host.url("/canvas/sess-S/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("scoped"));

    // Unknown session-shaped segment with no matching file: 404.
    let resp = reqwest::get(host.url("/canvas/sess-unknown/")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

// ─── URLs, health, metrics ────────────────────────────────────────────────────

#[tokio::test]
async fn signed_url_happy_path() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut config = CanvasConfig::load(
        data.path().to_path_buf(),
        CliOverrides {
            root: Some(root.path().to_path_buf()),
            ..Default::default()
        },
    )
    .unwrap();
    config.tokens.secret = SECRET.to_string();
    config.tokens.ttl = Duration::from_secs(3600);
    let port = config.port;

    let manager: SharedManager = Arc::new(CanvasManager::new(Some(Arc::new(MemoryStore::new()))));
    let host = CanvasHost::new(config, manager).unwrap();

    let url = host
        .signed_session_url(&UrlRequest::default(), "sess-42", "editor", None)
        .unwrap();
    let expected_base = format!("http://127.0.0.1:{port}{NS}/canvas/sess-42/?token=");
    assert!(url.starts_with(&expected_base), "got: {url}");

    let raw = url.rsplit_once("?token=").unwrap().1;
    let claims = token::parse(SECRET, raw).unwrap();
    assert_eq!(claims.session_id, "sess-42");
    assert_eq!(claims.role.as_deref(), Some("editor"));
    let now = Utc::now().timestamp();
    assert!((claims.expires_at - now - 3600).abs() < 5);
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let host = spawn_host(|_| {}, true).await;

    let health: Value = reqwest::get(host.url("/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    host.metrics.inc_updates();
    let text = reqwest::get(host.url("/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("canvasd_updates_total 1"));
}
