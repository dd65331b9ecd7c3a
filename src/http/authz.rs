//! Request authorization for `/stream` and `/action`.
//!
//! A request is satisfied by a valid canvas token bound to the addressed
//! session, or — when an auth service is wired — by an authenticated user
//! (bearer JWT, then API key header, then session cookie). Expired tokens
//! surface as `Expired`; every other failure collapses to `Unauthorized`.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::sync::Arc;

use super::HostState;
use crate::error::{CanvasError, Result};
use crate::role::Role;
use crate::token;

/// Header carrying a canvas token outside the query string.
pub const TOKEN_HEADER: &str = "x-canvas-token";
/// Header carrying an auth-service API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Authenticated principal produced by the external auth service.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
}

/// Narrow seam to the gateway's authentication service. Each check returns
/// the authenticated user or `None`; the service never sees canvas tokens.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn verify_bearer(&self, token: &str) -> Option<AuthUser>;
    async fn verify_api_key(&self, key: &str) -> Option<AuthUser>;
    async fn verify_session_cookie(&self, cookie: &str) -> Option<AuthUser>;
}

pub type SharedAuthService = Arc<dyn AuthService>;

/// Outcome of a successful authorization.
#[derive(Debug, Clone, Default)]
pub struct SessionAuthz {
    /// Role claim from a valid canvas token; `None` when the request was
    /// satisfied by the auth service or verification is disabled.
    pub token_role: Option<Role>,
    /// User identity — token `uid` claim or authenticated user.
    pub user_id: Option<String>,
}

impl SessionAuthz {
    /// Token role when present, else the configured default.
    pub fn effective_role(&self, default_role: &str) -> Role {
        self.token_role
            .unwrap_or_else(|| Role::normalize(default_role))
    }
}

fn bearer_value(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Canvas token transport: query `token`, `X-Canvas-Token`, `Authorization:
/// Bearer`, in that order.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(t) = query_token.filter(|t| !t.is_empty()) {
        return Some(t.to_string());
    }
    if let Some(t) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if !t.is_empty() {
            return Some(t.to_string());
        }
    }
    bearer_value(headers).map(str::to_string)
}

/// Authorize a request addressed at `session_id`.
///
/// - Token secret configured and a token present: parse it. Parse failure
///   with no auth service is terminal; a parsed token must be bound to the
///   addressed session.
/// - Auth service configured: bearer JWT, then API key, then session
///   cookie; an authenticated user satisfies the request when no valid
///   token was provided.
/// - Neither: `Unauthorized` — unless token verification is disabled and no
///   auth service is wired, in which case access is open and anonymous.
pub async fn authorize_session_request(
    state: &HostState,
    headers: &HeaderMap,
    query_token: Option<&str>,
    session_id: &str,
) -> Result<SessionAuthz> {
    let raw = extract_token(headers, query_token);
    let mut token_err: Option<CanvasError> = None;

    if state.config.tokens.enabled() {
        if let Some(raw) = &raw {
            match token::parse(&state.config.tokens.secret, raw) {
                Ok(claims) => {
                    // Never accept a token minted for a different session.
                    if claims.session_id != session_id {
                        return Err(CanvasError::Unauthorized);
                    }
                    return Ok(SessionAuthz {
                        token_role: Some(Role::normalize(claims.role.as_deref().unwrap_or(""))),
                        user_id: claims.user_id,
                    });
                }
                Err(e) => {
                    if state.auth.is_none() {
                        return Err(match e {
                            CanvasError::Expired => CanvasError::Expired,
                            _ => CanvasError::Unauthorized,
                        });
                    }
                    token_err = Some(e);
                }
            }
        }
    }

    if let Some(auth) = &state.auth {
        let user = match bearer_value(headers) {
            Some(bearer) => auth.verify_bearer(bearer).await,
            None => None,
        };
        let user = match user {
            Some(u) => Some(u),
            None => match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
                Some(key) => auth.verify_api_key(key).await,
                None => None,
            },
        };
        let user = match user {
            Some(u) => Some(u),
            None => match headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
                Some(cookie) => auth.verify_session_cookie(cookie).await,
                None => None,
            },
        };
        if let Some(user) = user {
            return Ok(SessionAuthz {
                token_role: None,
                user_id: Some(user.id),
            });
        }
    }

    if state.config.tokens.enabled() || state.auth.is_some() {
        return Err(match token_err {
            Some(CanvasError::Expired) => CanvasError::Expired,
            _ => CanvasError::Unauthorized,
        });
    }

    // Verification disabled and no auth service: open access.
    Ok(SessionAuthz::default())
}
