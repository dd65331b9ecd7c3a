//! Append-only audit trail for canvas mutations.
//!
//! The manager records one entry per `push`/`reset`. The sink is an injected
//! trait object — absent means no auditing. The bundled implementation
//! writes one JSON line per entry to `{data_dir}/audit.log`, rotating to
//! `audit.log.1` at 50 MB. Audit failures are logged at WARN and never
//! propagated — a broken audit log must not interrupt canvas flow.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::error::Result;

/// Maximum audit log file size before rotation (50 MB).
const ROTATE_BYTES: u64 = 50 * 1024 * 1024;

// ─── Entry ────────────────────────────────────────────────────────────────────

/// One structured JSON line per canvas mutation.
///
/// Fields are `camelCase` for easy `jq` querying:
/// ```sh
/// jq 'select(.kind == "canvas.reset")' audit.log
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// RFC-3339 timestamp of when the mutation was processed.
    pub timestamp: String,
    /// `"canvas.update"` or `"canvas.reset"`.
    pub kind: String,
    /// Session the mutation applied to.
    pub session_id: String,
    /// User from the ambient call context, when known.
    pub user_id: Option<String>,
}

impl AuditEntry {
    pub fn new(
        kind: impl Into<String>,
        session_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            kind: kind.into(),
            session_id: session_id.into(),
            user_id,
        }
    }
}

// ─── Sink ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

pub type SharedAuditSink = Arc<dyn AuditSink>;

// ─── File-backed log ──────────────────────────────────────────────────────────

/// Rotating JSONL audit log. The file handle is cached for the process
/// lifetime to avoid an `open()` syscall on every entry.
pub struct AuditLog {
    path: PathBuf,
    /// Cached, open file handle; `None` until the first write.
    file: Mutex<Option<tokio::fs::File>>,
}

impl AuditLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("audit.log"),
            file: Mutex::new(None),
        }
    }

    async fn try_append(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| crate::error::CanvasError::Internal(format!("audit encode: {e}")))?
            + "\n";

        let mut guard = self.file.lock().await;

        // Rotation check: once the on-disk file passes the cap, drop the
        // handle and rename before opening a fresh one.
        if guard.is_some() {
            if let Ok(meta) = tokio::fs::metadata(&self.path).await {
                if meta.len() >= ROTATE_BYTES {
                    *guard = None; // drop file handle (flushes on drop)
                    let rotated = self.path.with_extension("log.1");
                    let _ = tokio::fs::rename(&self.path, &rotated).await;
                }
            }
        }

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| crate::error::CanvasError::Backend(e.into()))?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| crate::error::CanvasError::Backend(e.into()))?;
            *guard = Some(f);
        }

        if let Some(f) = guard.as_mut() {
            f.write_all(line.as_bytes())
                .await
                .map_err(|e| crate::error::CanvasError::Backend(e.into()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.try_append(&entry).await {
            tracing::warn!(err = %e, "audit log write failed");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
