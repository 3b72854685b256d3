//! Process-wide registry of in-flight runs.
//!
//! Not a `lazy_static` — owned by `AppState` and constructed once in
//! `main.rs`, per the anti-singleton design note. Registers a run on start,
//! deregisters it on terminal state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metrics::MetricsCollector;
use crate::model::RunStatus;

/// Shared state for one run, reachable both by the controller driving it
/// and by any inspector (the live-metrics SSE endpoint, the stop endpoint).
pub struct RunContext {
    pub run_id: String,
    pub should_stop: Arc<AtomicBool>,
    pub requests_sent: Arc<AtomicU64>,
    pub requests_expected: Arc<AtomicU64>,
    pub metrics: Arc<MetricsCollector>,
    pub started_at: Instant,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RunContext {
    /// Built before the controller task is spawned; `set_handle` attaches
    /// the task's `JoinHandle` once `tokio::spawn` returns one, so `stop`
    /// has something to await.
    pub fn new(run_id: String, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            run_id,
            should_stop: Arc::new(AtomicBool::new(false)),
            requests_sent: Arc::new(AtomicU64::new(0)),
            requests_expected: Arc::new(AtomicU64::new(0)),
            metrics,
            started_at: Instant::now(),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn is_stopping(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> (u64, u64) {
        (
            self.requests_sent.load(Ordering::Relaxed),
            self.requests_expected.load(Ordering::Relaxed),
        )
    }
}

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Registry mapping `runId` to its `RunContext`. Entries are removed once
/// the controller task backing them has actually finished, not merely
/// flagged — `stop` waits for that to happen (bounded by `STOP_GRACE`).
#[derive(Default)]
pub struct RunManager {
    runs: RwLock<HashMap<String, Arc<RunContext>>>,
}

impl RunManager {
    pub fn new() -> Self {
        Self { runs: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, ctx: Arc<RunContext>) {
        self.runs.write().await.insert(ctx.run_id.clone(), ctx);
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<RunContext>> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn deregister(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }

    pub async fn active_run_ids(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }

    /// Flips `should_stop` and waits up to `STOP_GRACE` for the controller
    /// task to exit. Returns the run's last known status if found.
    pub async fn stop(&self, run_id: &str) -> Option<RunStatus> {
        let ctx = self.get(run_id).await?;
        ctx.should_stop.store(true, Ordering::Relaxed);

        let handle = ctx.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!(run_id, "controller task did not exit within the graceful-stop window");
            }
        }
        self.deregister(run_id).await;
        Some(RunStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SamplingConfig;

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let manager = RunManager::new();
        let metrics = Arc::new(MetricsCollector::new(SamplingConfig::default()));
        let ctx = Arc::new(RunContext::new("run_1".into(), metrics));
        ctx.set_handle(tokio::spawn(async {}));
        manager.register(ctx).await;

        let fetched = manager.get("run_1").await;
        assert!(fetched.is_some());
        assert!(manager.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn stop_flips_flag_and_deregisters() {
        let manager = RunManager::new();
        let metrics = Arc::new(MetricsCollector::new(SamplingConfig::default()));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let ctx = Arc::new(RunContext::new("run_2".into(), metrics));
        ctx.set_handle(tokio::spawn(async move {
            let _ = rx.await;
        }));
        let flag = ctx.should_stop.clone();
        manager.register(ctx).await;

        let _ = tx.send(());
        let status = manager.stop("run_2").await;
        assert_eq!(status, Some(RunStatus::Stopped));
        assert!(flag.load(Ordering::Relaxed));
        assert!(manager.get("run_2").await.is_none());
    }

    #[tokio::test]
    async fn progress_tracks_sent_and_expected() {
        let metrics = Arc::new(MetricsCollector::new(SamplingConfig::default()));
        let ctx = RunContext::new("run_3".into(), metrics);
        ctx.requests_expected.store(100, Ordering::Relaxed);
        ctx.requests_sent.store(42, Ordering::Relaxed);
        assert_eq!(ctx.progress(), (42, 100));
    }
}
