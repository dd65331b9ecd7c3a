//! Signed, expiring canvas access tokens.
//!
//! Wire format: `base64url(payload) "." base64url(hmac_sha256(secret, base64url(payload)))`
//! where the payload is compact JSON `{"sid":…, "uid":…?, "role":…?, "exp":…}`.
//! `exp` is absolute epoch seconds; zero means no expiry. The layout is a
//! stable wire format — a future signing algorithm must version it by
//! prefixing the payload.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::error::{CanvasError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Claims bound to exactly one canvas session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    #[serde(rename = "sid")]
    pub session_id: String,
    #[serde(rename = "uid", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "role", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Absolute expiry in epoch seconds; 0 = no expiry.
    #[serde(rename = "exp", default)]
    pub expires_at: i64,
}

impl AccessToken {
    /// Build a token for `session_id` expiring `ttl` from now (zero ttl = no expiry).
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<String>,
        role: Option<String>,
        ttl: Duration,
    ) -> Self {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            Utc::now().timestamp() + ttl.as_secs() as i64
        };
        Self {
            session_id: session_id.into(),
            user_id,
            role,
            expires_at,
        }
    }
}

/// Sign `token` with `secret` and return the compact two-part encoding.
pub fn sign(secret: &str, token: &AccessToken) -> Result<String> {
    if secret.is_empty() {
        return Err(CanvasError::invalid("token secret is empty"));
    }
    let payload = serde_json::to_vec(token)
        .map_err(|e| CanvasError::Internal(format!("token encode: {e}")))?;
    let encoded = URL_SAFE_NO_PAD.encode(payload);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CanvasError::Internal(format!("hmac init: {e}")))?;
    mac.update(encoded.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{encoded}.{signature}"))
}

/// Verify `raw` against `secret` and return the embedded claims.
///
/// The signature comparison is constant-time, independent of where a
/// mismatch occurs. Any shape, decode, or signature problem is `Invalid`;
/// only a structurally valid token past its `exp` is `Expired`.
pub fn parse(secret: &str, raw: &str) -> Result<AccessToken> {
    if secret.is_empty() {
        return Err(CanvasError::invalid("token secret is empty"));
    }

    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(CanvasError::invalid("malformed token"));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| CanvasError::invalid("malformed token signature"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CanvasError::Internal(format!("hmac init: {e}")))?;
    mac.update(parts[0].as_bytes());
    let expected = mac.finalize().into_bytes();

    if !constant_time_eq(expected.as_slice(), &signature) {
        return Err(CanvasError::invalid("token signature mismatch"));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|_| CanvasError::invalid("malformed token payload"))?;
    let token: AccessToken = serde_json::from_slice(&payload)
        .map_err(|_| CanvasError::invalid("malformed token payload"))?;

    if token.session_id.is_empty() {
        return Err(CanvasError::invalid("token missing session id"));
    }
    if token.expires_at > 0 && Utc::now().timestamp() > token.expires_at {
        return Err(CanvasError::Expired);
    }

    Ok(token)
}

/// Constant-time byte comparison — no short-circuit on mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
