//! Static file serving with optional live-reload injection.
//!
//! Canvas paths go through the session-aware resolver; aux paths through the
//! plain one. HTML responses get a single `<script src="…/live.js">` tag
//! inserted before `</body>` (falling back to `</head>`, falling back to
//! append) when live reload and client injection are both on. Injection is
//! idempotent.

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::Path;
use std::sync::Arc;

use super::{HostState, HttpError};
use crate::error::CanvasError;

pub async fn canvas_root_redirect(State(state): State<Arc<HostState>>) -> Response {
    let location = format!("{}/canvas/", state.config.namespace);
    (
        StatusCode::FOUND,
        [(header::LOCATION, location)],
    )
        .into_response()
}

pub async fn serve_canvas_index(
    State(state): State<Arc<HostState>>,
) -> Result<Response, HttpError> {
    serve_canvas_path(&state, "").await
}

pub async fn serve_canvas(
    State(state): State<Arc<HostState>>,
    UrlPath(rest): UrlPath<String>,
) -> Result<Response, HttpError> {
    serve_canvas_path(&state, &rest).await
}

pub async fn serve_aux(
    State(state): State<Arc<HostState>>,
    UrlPath(rest): UrlPath<String>,
) -> Result<Response, HttpError> {
    let path = state.resolver.resolve_aux(&rest).await?;
    Ok(file_response(&path, read_file(&path).await?))
}

async fn serve_canvas_path(state: &HostState, rest: &str) -> Result<Response, HttpError> {
    let path = state.resolver.resolve_canvas(rest).await?;
    let bytes = read_file(&path).await?;

    let ctype = content_type_for(&path);
    if ctype == "text/html; charset=utf-8" && state.config.live_reload && state.config.inject_client
    {
        let html = String::from_utf8_lossy(&bytes);
        let script_url = format!("{}/live.js", state.config.namespace);
        let injected = inject_live_reload(&html, &script_url);
        return Ok((
            [(header::CONTENT_TYPE, ctype)],
            injected.into_bytes(),
        )
            .into_response());
    }
    Ok(file_response(&path, bytes))
}

async fn read_file(path: &Path) -> Result<Vec<u8>, HttpError> {
    tokio::fs::read(path)
        .await
        .map_err(|_| HttpError(CanvasError::not_found(path.display().to_string())))
}

fn file_response(path: &Path, bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, content_type_for(path))], bytes).into_response()
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "txt" | "md" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Insert the live-reload client script exactly once.
pub fn inject_live_reload(html: &str, script_url: &str) -> String {
    if html.contains(script_url) {
        return html.to_string();
    }
    let tag = format!("<script src=\"{script_url}\"></script>");
    let lower = html.to_ascii_lowercase();
    for anchor in ["</body>", "</head>"] {
        if let Some(idx) = lower.find(anchor) {
            let mut out = String::with_capacity(html.len() + tag.len());
            out.push_str(&html[..idx]);
            out.push_str(&tag);
            out.push_str(&html[idx..]);
            return out;
        }
    }
    let mut out = html.to_string();
    out.push_str(&tag);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "/__nexus__/live.js";

    #[test]
    fn injects_before_body_close() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_live_reload(html, SCRIPT);
        assert_eq!(
            out,
            "<html><body><p>hi</p><script src=\"/__nexus__/live.js\"></script></body></html>"
        );
    }

    #[test]
    fn falls_back_to_head_close() {
        let html = "<html><head><title>t</title></head>";
        let out = inject_live_reload(html, SCRIPT);
        assert!(out.contains("</script></head>"));
    }

    #[test]
    fn appends_when_no_anchor() {
        let html = "<p>fragment</p>";
        let out = inject_live_reload(html, SCRIPT);
        assert!(out.ends_with("</script>"));
    }

    #[test]
    fn injection_is_idempotent() {
        let html = "<html><body></body></html>";
        let once = inject_live_reload(html, SCRIPT);
        let twice = inject_live_reload(&once, SCRIPT);
        assert_eq!(once, twice);
        assert_eq!(once.matches(SCRIPT).count(), 1);
    }

    #[test]
    fn anchor_matching_is_case_insensitive() {
        let html = "<HTML><BODY></BODY></HTML>";
        let out = inject_live_reload(html, SCRIPT);
        assert!(out.contains("</script></BODY>"));
    }

    #[test]
    fn content_types_cover_common_assets() {
        assert_eq!(
            content_type_for(Path::new("a/index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            content_type_for(Path::new("app.js")),
            "text/javascript; charset=utf-8"
        );
        assert_eq!(content_type_for(Path::new("x.png")), "image/png");
        assert_eq!(
            content_type_for(Path::new("blob.bin")),
            "application/octet-stream"
        );
    }
}
