//! Canvas URL minting.
//!
//! `scheme://host:port/<namespace>/canvas/<session_id>/`, with the scheme
//! from the explicit override, then the first `X-Forwarded-Proto` value,
//! else `http`; the host from the explicit override, the request Host
//! header, the bind address, else `localhost` — demoting loopback hosts
//! when a better candidate exists. IPv6 hosts are bracketed.

use axum::http::{header, HeaderMap};

use crate::config::CanvasConfig;
use crate::error::Result;
use crate::role::Role;
use crate::token::{self, AccessToken};

/// Per-request inputs to URL minting, captured from the inbound headers.
#[derive(Debug, Clone, Default)]
pub struct UrlRequest {
    pub forwarded_proto: Option<String>,
    pub host_header: Option<String>,
}

impl UrlRequest {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            forwarded_proto: headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            host_header: headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]" | "0.0.0.0")
}

/// Strip a `:port` suffix from a Host header value, keeping bracketed IPv6
/// literals intact.
fn host_without_port(value: &str) -> String {
    if let Some(end) = value.strip_prefix('[').and_then(|v| v.find(']')) {
        return value[..end + 2].to_string();
    }
    match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => value.to_string(),
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn choose_scheme(config: &CanvasConfig, req: &UrlRequest) -> String {
    if let Some(scheme) = &config.public_scheme {
        return scheme.clone();
    }
    if let Some(proto) = &req.forwarded_proto {
        // Proxies may append: take the first value.
        if let Some(first) = proto.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    "http".to_string()
}

fn choose_host(config: &CanvasConfig, req: &UrlRequest) -> String {
    let candidates = [
        config.public_host.clone(),
        req.host_header.as_deref().map(host_without_port),
        Some(config.host.clone()).filter(|h| !h.is_empty()),
    ];

    // First pass: prefer a non-loopback candidate.
    for candidate in candidates.iter().flatten() {
        if !is_loopback(candidate) {
            return bracket_ipv6(candidate);
        }
    }
    // Second pass: any candidate at all.
    if let Some(candidate) = candidates.iter().flatten().next() {
        return bracket_ipv6(candidate);
    }
    "localhost".to_string()
}

pub fn canvas_session_url(config: &CanvasConfig, req: &UrlRequest, session_id: &str) -> String {
    format!(
        "{}://{}:{}{}/canvas/{}/",
        choose_scheme(config, req),
        choose_host(config, req),
        config.port,
        config.namespace,
        session_id
    )
}

pub fn signed_session_url(
    config: &CanvasConfig,
    req: &UrlRequest,
    session_id: &str,
    role: &str,
    user_id: Option<String>,
) -> Result<String> {
    let claims = AccessToken::new(
        session_id,
        user_id,
        Some(Role::normalize(role).as_str().to_string()),
        config.tokens.ttl,
    );
    let minted = token::sign(&config.tokens.secret, &claims)?;
    Ok(format!(
        "{}?token={}",
        canvas_session_url(config, req, session_id),
        minted
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CanvasConfig, CliOverrides};

    fn config() -> CanvasConfig {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CanvasConfig::load(
            dir.path().to_path_buf(),
            CliOverrides {
                root: Some(dir.path().to_path_buf()),
                port: Some(4310),
                ..Default::default()
            },
        )
        .unwrap();
        cfg.tokens.secret = "s3cret".to_string();
        cfg.tokens.ttl = std::time::Duration::from_secs(3600);
        cfg
    }

    #[test]
    fn plain_url_shape() {
        let url = canvas_session_url(&config(), &UrlRequest::default(), "sess-42");
        assert_eq!(url, "http://127.0.0.1:4310/__nexus__/canvas/sess-42/");
    }

    #[test]
    fn host_header_beats_bind_host() {
        let req = UrlRequest {
            forwarded_proto: None,
            host_header: Some("canvas.example.com:8443".to_string()),
        };
        let url = canvas_session_url(&config(), &req, "s");
        assert!(url.starts_with("http://canvas.example.com:4310/"));
    }

    #[test]
    fn forwarded_proto_first_value_wins() {
        let req = UrlRequest {
            forwarded_proto: Some("https, http".to_string()),
            host_header: Some("canvas.example.com".to_string()),
        };
        let url = canvas_session_url(&config(), &req, "s");
        assert!(url.starts_with("https://canvas.example.com:4310/"));
    }

    #[test]
    fn loopback_demoted_when_better_host_exists() {
        let req = UrlRequest {
            forwarded_proto: None,
            host_header: Some("localhost:4310".to_string()),
        };
        let mut cfg = config();
        cfg.public_host = Some("gateway.internal".to_string());
        let url = canvas_session_url(&cfg, &req, "s");
        assert!(url.starts_with("http://gateway.internal:4310/"));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let mut cfg = config();
        cfg.public_host = Some("2001:db8::1".to_string());
        let url = canvas_session_url(&cfg, &UrlRequest::default(), "s");
        assert!(url.starts_with("http://[2001:db8::1]:4310/"));
    }

    #[test]
    fn signed_url_round_trips() {
        let cfg = config();
        let url = signed_session_url(&cfg, &UrlRequest::default(), "sess-42", "editor", None)
            .unwrap();
        let (base, token_part) = url.split_once("?token=").unwrap();
        assert_eq!(base, "http://127.0.0.1:4310/__nexus__/canvas/sess-42/");

        let claims = crate::token::parse("s3cret", token_part).unwrap();
        assert_eq!(claims.session_id, "sess-42");
        assert_eq!(claims.role.as_deref(), Some("editor"));
        let now = chrono::Utc::now().timestamp();
        assert!((claims.expires_at - now - 3600).abs() < 5);
    }
}
