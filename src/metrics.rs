//! In-process canvas counters exposed as Prometheus text.
//!
//! All counters are `AtomicU64` incremented inline — no external registry.
//! The handle is created once at startup and passed into the manager and
//! host; components treat it as optional and no-op when absent.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct CanvasMetrics {
    /// Total state pushes/resets applied through the manager.
    pub updates_total: AtomicU64,
    /// Total actions accepted by the ingress.
    pub actions_total: AtomicU64,
    /// Total live-reload broadcasts fired by the watcher.
    pub reloads_total: AtomicU64,
    /// Currently connected stream subscribers.
    pub active_viewers: AtomicI64,
    /// Host start time — used for the uptime gauge.
    pub started_at: Instant,
}

impl CanvasMetrics {
    pub fn new() -> Self {
        Self {
            updates_total: AtomicU64::new(0),
            actions_total: AtomicU64::new(0),
            reloads_total: AtomicU64::new(0),
            active_viewers: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc_updates(&self) {
        self.updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_actions(&self) {
        self.actions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reloads(&self) {
        self.reloads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn viewer_connected(&self) {
        self.active_viewers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn viewer_disconnected(&self) {
        self.active_viewers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_viewers(&self) -> i64 {
        self.active_viewers.load(Ordering::Relaxed)
    }

    /// Render counters in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let uptime = self.started_at.elapsed().as_secs();
        let updates = self.updates_total.load(Ordering::Relaxed);
        let actions = self.actions_total.load(Ordering::Relaxed);
        let reloads = self.reloads_total.load(Ordering::Relaxed);
        let viewers = self.active_viewers();

        format!(
            "# HELP canvasd_uptime_seconds Host uptime in seconds.\n\
             # TYPE canvasd_uptime_seconds gauge\n\
             canvasd_uptime_seconds {uptime}\n\
             # HELP canvasd_active_viewers Currently connected stream subscribers.\n\
             # TYPE canvasd_active_viewers gauge\n\
             canvasd_active_viewers {viewers}\n\
             # HELP canvasd_updates_total Canvas updates applied since start.\n\
             # TYPE canvasd_updates_total counter\n\
             canvasd_updates_total {updates}\n\
             # HELP canvasd_actions_total Actions accepted since start.\n\
             # TYPE canvasd_actions_total counter\n\
             canvasd_actions_total {actions}\n\
             # HELP canvasd_reloads_total Live-reload broadcasts since start.\n\
             # TYPE canvasd_reloads_total counter\n\
             canvasd_reloads_total {reloads}\n"
        )
    }
}

impl Default for CanvasMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle — cheaply clonable.
pub type SharedMetrics = Arc<CanvasMetrics>;
