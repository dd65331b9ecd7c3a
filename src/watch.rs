//! Asset-tree watcher and live-reload fan-out.
//!
//! A recursive watch over the canvas root (and the aux UI root when
//! distinct). Relevant events — create/write/remove/rename outside hidden
//! directories and `node_modules` — feed a trailing-edge debounce: a burst
//! yields exactly one reload broadcast 200 ms after the last event. The
//! broadcast reaches every live-reload WebSocket client; the socket task
//! enforces a 2 s write deadline and drops clients that miss it.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CanvasError, Result};
use crate::metrics::SharedMetrics;

/// Trailing-edge debounce window for reload broadcasts.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// Per-client write deadline for the `reload` frame.
pub const RELOAD_WRITE_DEADLINE: Duration = Duration::from_secs(2);

// ─── Live-reload client set ───────────────────────────────────────────────────

/// Registry of connected live-reload WebSocket clients.
///
/// Broadcast snapshots the sender set under the lock, then notifies outside
/// it, so no I/O ever happens while the registry is held.
#[derive(Default)]
pub struct LiveReloadHub {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<()>>>,
    next_id: AtomicU64,
}

impl LiveReloadHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; the receiver yields one unit per pending reload.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Queue a reload for every connected client. Returns how many clients
    /// were notified; clients whose channel is gone are pruned.
    pub fn notify_reload(&self) -> usize {
        let snapshot: Vec<(u64, mpsc::UnboundedSender<()>)> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        let mut notified = 0;
        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(()).is_ok() {
                notified += 1;
            } else {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                clients.remove(&id);
            }
        }
        notified
    }
}

// ─── Watcher ──────────────────────────────────────────────────────────────────

/// Segments relative to a watch root that never trigger reloads.
fn is_ignored(root: &Path, path: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        // Outside every root we know about — ignore.
        Err(_) => return true,
    };
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name.starts_with('.') || name == "node_modules"
    })
}

fn is_relevant_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Recursive watch over the asset roots with a trailing-edge debounced
/// reload broadcast. Newly created directories join the watch set
/// automatically (`RecursiveMode::Recursive`). Dropping the watcher stops
/// both the filesystem watch and the debounce task.
///
/// Must be started from within a tokio runtime.
pub struct AssetWatcher {
    _watcher: RecommendedWatcher,
    debounce_task: tokio::task::JoinHandle<()>,
}

impl AssetWatcher {
    pub fn start(
        roots: &[PathBuf],
        live: Arc<LiveReloadHub>,
        metrics: Option<SharedMetrics>,
    ) -> Result<Self> {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();

        let filter_roots: Vec<PathBuf> = roots.to_vec();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        let relevant = is_relevant_kind(&event.kind)
                            && event
                                .paths
                                .iter()
                                .any(|p| filter_roots.iter().any(|r| !is_ignored(r, p)));
                        if relevant {
                            let _ = dirty_tx.send(());
                        }
                    }
                    Err(e) => warn!(err = %e, "asset watcher error"),
                }
            })
            .map_err(|e| CanvasError::Backend(e.into()))?;

        for root in roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| CanvasError::Backend(e.into()))?;
        }

        // Trailing-edge debounce: wait for the burst to go quiet for the
        // full window, then broadcast exactly once.
        let debounce_task = tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(RELOAD_DEBOUNCE, dirty_rx.recv()).await {
                        Ok(Some(())) => continue, // burst still going — restart window
                        Ok(None) => return,       // watcher dropped
                        Err(_) => break,          // quiet — fire
                    }
                }
                let clients = live.notify_reload();
                debug!(clients, "asset change — live reload");
                if let Some(metrics) = &metrics {
                    metrics.inc_reloads();
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            debounce_task,
        })
    }
}

impl Drop for AssetWatcher {
    fn drop(&mut self) {
        self.debounce_task.abort();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_and_node_modules_are_ignored() {
        let root = Path::new("/srv/canvas");
        assert!(is_ignored(root, Path::new("/srv/canvas/.git/HEAD")));
        assert!(is_ignored(root, Path::new("/srv/canvas/a/.cache/x.js")));
        assert!(is_ignored(
            root,
            Path::new("/srv/canvas/node_modules/pkg/index.js")
        ));
        assert!(!is_ignored(root, Path::new("/srv/canvas/app/index.html")));
    }

    #[test]
    fn paths_outside_root_are_ignored() {
        let root = Path::new("/srv/canvas");
        assert!(is_ignored(root, Path::new("/etc/hosts")));
    }

    #[test]
    fn reload_reaches_every_registered_client() {
        let hub = LiveReloadHub::new();
        let (_id1, mut rx1) = hub.register();
        let (_id2, mut rx2) = hub.register();

        assert_eq!(hub.notify_reload(), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn dropped_clients_are_pruned() {
        let hub = LiveReloadHub::new();
        let (_id1, rx1) = hub.register();
        let (_id2, _rx2) = hub.register();
        drop(rx1);

        assert_eq!(hub.notify_reload(), 1);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn unregister_removes_client() {
        let hub = LiveReloadHub::new();
        let (id, _rx) = hub.register();
        hub.unregister(id);
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.notify_reload(), 0);
    }

    #[tokio::test]
    async fn burst_yields_exactly_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(LiveReloadHub::new());
        let (_id, mut rx) = hub.register();

        let _watcher =
            AssetWatcher::start(&[dir.path().to_path_buf()], Arc::clone(&hub), None).unwrap();
        // Give the OS watch a moment to establish.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.html")), "x").unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // One reload lands once the burst has been quiet for the window.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no reload within deadline")
            .unwrap();
        // And only one.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(rx.try_recv().is_err());
    }
}
