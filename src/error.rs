//! Error taxonomy for the canvas subsystem.
//!
//! The first three storage kinds (`NotFound`, `AlreadyExists`, `Invalid`) are
//! precise and drive control flow; `Backend` carries infrastructure failures
//! unchanged. The HTTP layer maps every kind onto a status code and a terse,
//! stable body so UIs can match on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanvasError {
    /// Malformed input: bad session id, bad token shape, unparsable body.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Token past its `exp` claim.
    #[error("token expired")]
    Expired,

    /// No valid credential presented.
    #[error("unauthorized")]
    Unauthorized,

    /// Credential valid but role insufficient.
    #[error("forbidden")]
    Forbidden,

    /// No such session / state / event log / file.
    #[error("not found: {0}")]
    NotFound(String),

    /// Session id or key collision.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A required collaborator (store, action handler) is not wired.
    #[error("unavailable: {0}")]
    Unavailable(&'static str),

    /// Request body over the ingress cap.
    #[error("body too large")]
    TooLarge,

    /// Admission denied by the rate limiter.
    #[error("rate limited")]
    RateLimited,

    /// Storage / IO failure, surfaced unchanged.
    #[error("backend: {0}")]
    Backend(#[from] anyhow::Error),

    /// Handler or encoder failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl CanvasError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CanvasError::Invalid(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CanvasError::NotFound(what.into())
    }

    /// HTTP status this error renders as.
    pub fn http_status(&self) -> u16 {
        match self {
            CanvasError::Invalid(_) => 400,
            CanvasError::Expired => 401,
            CanvasError::Unauthorized => 401,
            CanvasError::Forbidden => 403,
            CanvasError::NotFound(_) => 404,
            CanvasError::AlreadyExists(_) => 409,
            CanvasError::TooLarge => 413,
            CanvasError::RateLimited => 429,
            CanvasError::Backend(_) | CanvasError::Internal(_) => 500,
            CanvasError::Unavailable(_) => 503,
        }
    }

    /// Terse, stable response body. Never includes internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            CanvasError::Invalid(_) => "Bad Request",
            CanvasError::Expired => "Token expired",
            CanvasError::Unauthorized => "Unauthorized",
            CanvasError::Forbidden => "Forbidden",
            CanvasError::NotFound(_) => "Not Found",
            CanvasError::AlreadyExists(_) => "Conflict",
            CanvasError::TooLarge => "Request Entity Too Large",
            CanvasError::RateLimited => "Too Many Requests",
            CanvasError::Backend(_) | CanvasError::Internal(_) => "Internal Server Error",
            CanvasError::Unavailable(_) => "Service Unavailable",
        }
    }
}

pub type Result<T, E = CanvasError> = std::result::Result<T, E>;
