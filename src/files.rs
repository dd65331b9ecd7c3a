//! Root-bounded, symlink-safe file resolution for canvas assets.
//!
//! Two roots: the canvas static root (required) and the auxiliary UI root
//! (optional). Under the canvas root the first path segment may name a
//! session id, in which case the file is served from `<root>/<session_id>/…`.
//! Every escape — lexical traversal, symlink candidate, or a real path
//! outside the canonical root — resolves to `NotFound`, never a distinct
//! error class.

use std::path::{Path, PathBuf};

use crate::error::{CanvasError, Result};
use crate::store::SharedStore;

/// Session-id grammar: non-empty, no `..` substring, characters from
/// `[A-Za-z0-9_.:-]`.
pub fn is_valid_session_id(s: &str) -> bool {
    !s.is_empty()
        && !s.contains("..")
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

/// Lexically clean a request path: collapse slashes, resolve `.`/`..`.
/// Returns the cleaned segments, or `None` when `..` climbs above the root.
fn clean_segments(request_path: &str) -> Option<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for part in request_path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                // A pop past the top means the path starts with "/.." once
                // normalized — refuse it outright.
                segments.pop()?;
            }
            other => segments.push(other.to_string()),
        }
    }
    Some(segments)
}

pub struct FileResolver {
    canvas_root: PathBuf,
    aux_root: Option<PathBuf>,
    auto_index: bool,
    store: Option<SharedStore>,
}

impl FileResolver {
    /// Both roots are canonicalized up front; the canvas root must exist.
    pub fn new(canvas_root: &Path, aux_root: Option<&Path>, auto_index: bool) -> Result<Self> {
        let canvas_root = canvas_root.canonicalize().map_err(|e| {
            CanvasError::invalid(format!(
                "canvas root {}: {e}",
                canvas_root.display()
            ))
        })?;
        let aux_root = match aux_root {
            Some(root) => Some(root.canonicalize().map_err(|e| {
                CanvasError::invalid(format!("a2ui root {}: {e}", root.display()))
            })?),
            None => None,
        };
        Ok(Self {
            canvas_root,
            aux_root,
            auto_index,
            store: None,
        })
    }

    /// Attach the session store used to recognize session-scoped first
    /// segments. Without a store every path resolves root-relative.
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn canvas_root(&self) -> &Path {
        &self.canvas_root
    }

    /// Resolve a request path under the canvas root, honoring session
    /// scoping for a known-session first segment.
    pub async fn resolve_canvas(&self, request_path: &str) -> Result<PathBuf> {
        let segments = clean_segments(request_path)
            .ok_or_else(|| CanvasError::not_found(request_path.to_string()))?;

        if let Some(first) = segments.first() {
            if is_valid_session_id(first) {
                if self.session_known(first).await {
                    return self.resolve_under(&self.canvas_root, &segments).await;
                }
                // Unknown session id: fall back to a plain file lookup when a
                // file of that exact name exists in the root. This shadows
                // filenames that happen to look like session ids.
                if !self.canvas_root.join(first).exists() {
                    return Err(CanvasError::not_found(request_path.to_string()));
                }
            }
        }
        self.resolve_under(&self.canvas_root, &segments).await
    }

    /// Resolve a request path under the auxiliary UI root.
    pub async fn resolve_aux(&self, request_path: &str) -> Result<PathBuf> {
        let root = self
            .aux_root
            .as_ref()
            .ok_or_else(|| CanvasError::not_found(request_path.to_string()))?;
        let segments = clean_segments(request_path)
            .ok_or_else(|| CanvasError::not_found(request_path.to_string()))?;
        self.resolve_under(root, &segments).await
    }

    async fn session_known(&self, id: &str) -> bool {
        match &self.store {
            Some(store) => store.get_session(id).await.is_ok(),
            None => false,
        }
    }

    async fn resolve_under(&self, root: &Path, segments: &[String]) -> Result<PathBuf> {
        let not_found = || CanvasError::not_found(segments.join("/"));

        let mut candidate = root.to_path_buf();
        for segment in segments {
            candidate.push(segment);
        }

        let mut meta = tokio::fs::symlink_metadata(&candidate)
            .await
            .map_err(|_| not_found())?;
        if meta.file_type().is_symlink() {
            return Err(not_found());
        }
        if meta.is_dir() {
            if !self.auto_index {
                return Err(not_found());
            }
            candidate.push("index.html");
            meta = tokio::fs::symlink_metadata(&candidate)
                .await
                .map_err(|_| not_found())?;
            if meta.file_type().is_symlink() {
                return Err(not_found());
            }
        }

        // Root-containment check on the fully resolved real path. Component
        // comparison via starts_with enforces the separator boundary.
        let real = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|_| not_found())?;
        if real != root && !real.starts_with(root) {
            return Err(not_found());
        }
        Ok(real)
    }
}
