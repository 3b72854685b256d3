//! Spawns N workers, shards submissions round-robin, aggregates their
//! atomic counters.
//!
//! Grounded on the teacher's `main.rs` worker-spawn loop (one `tokio::spawn`
//! per concurrent task, `Vec<JoinHandle>` joined at shutdown), generalized
//! from a single fire-and-forget loop per task into a proper queue-fed
//! worker pool per the Worker/Event-loop split.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::dns::DnsCache;
use crate::metrics::MetricsCollector;
use crate::model::{generate_id, ResultRecord};
use crate::pool::HandlePool;
use crate::ratelimiter::TokenBucket;
use crate::worker::{RequestTemplate, Transfer, Worker, WorkerCounters};

const QUEUE_CAPACITY: usize = 4096;

struct WorkerSlot {
    sender: mpsc::Sender<Transfer>,
    counters: Arc<WorkerCounters>,
    limiter: Option<Arc<TokenBucket>>,
    handle: JoinHandle<()>,
}

/// Owns a fixed pool of workers for the lifetime of one run. Never a
/// `lazy_static` — constructed by the run controller and dropped with it.
pub struct EventLoop {
    workers: Vec<WorkerSlot>,
    next: AtomicUsize,
}

impl EventLoop {
    /// `target_rps` is the run's *aggregate* target, if any. Each worker
    /// gets its own `TokenBucket` paced at `target_rps / worker_count` so
    /// the aggregate holds regardless of per-worker scheduling skew —
    /// sharing a single bucket across workers would serialize their
    /// acquires under lock contention at high worker counts.
    pub fn spawn(
        worker_count: usize,
        max_concurrent_per_worker: usize,
        pool: Arc<HandlePool>,
        target_rps: Option<f64>,
        metrics: Arc<MetricsCollector>,
        run_id: Arc<str>,
        dns_cache: Arc<DnsCache>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
            let counters = Arc::new(WorkerCounters::default());
            let limiter = target_rps.map(|rate| {
                Arc::new(TokenBucket::with_default_burst(rate / worker_count as f64))
            });
            let worker = Worker {
                id,
                pool: pool.clone(),
                limiter: limiter.clone(),
                metrics: metrics.clone(),
                run_id: run_id.clone(),
                counters: counters.clone(),
                dns_cache: dns_cache.clone(),
            };
            let handle = tokio::spawn(worker.run(receiver, max_concurrent_per_worker));
            workers.push(WorkerSlot { sender, counters, limiter, handle });
        }
        Self { workers, next: AtomicUsize::new(0) }
    }

    /// Re-paces every worker's limiter to a new aggregate target, used by
    /// the run controller to drive ramp-up stages without respawning
    /// workers. A no-op on workers that were spawned unlimited (`None`) —
    /// a run cannot switch from unlimited to rate-limited mid-flight.
    pub fn retarget_rps(&self, target_rps: f64) {
        let per_worker = target_rps / self.workers.len() as f64;
        for worker in &self.workers {
            if let Some(limiter) = &worker.limiter {
                limiter.set_rate(per_worker);
            }
        }
    }

    fn pick_worker(&self) -> &WorkerSlot {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    /// Assigns an id, places the transfer on the next worker's queue
    /// round-robin. Returns the assigned request id, or `None` if every
    /// worker's queue is closed (the loop has been stopped).
    pub async fn submit(&self, template: Arc<RequestTemplate>) -> Option<String> {
        let id = generate_id("req");
        let slot = self.pick_worker();
        slot.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let transfer = Transfer { id: id.clone(), template, completion: None };
        slot.sender.send(transfer).await.ok()?;
        Some(id)
    }

    /// Same as `submit`, but resolves to the transfer's outcome.
    pub async fn submit_async(&self, template: Arc<RequestTemplate>) -> Option<ResultRecord> {
        let id = generate_id("req");
        let slot = self.pick_worker();
        slot.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let transfer = Transfer { id, template, completion: Some(tx) };
        slot.sender.send(transfer).await.ok()?;
        rx.await.ok()
    }

    /// Submits every request and awaits every outcome.
    pub async fn execute_batch(&self, templates: Vec<Arc<RequestTemplate>>) -> Vec<Option<ResultRecord>> {
        let futures = templates.into_iter().map(|t| self.submit_async(t));
        futures_util::future::join_all(futures).await
    }

    pub fn active_count(&self) -> u64 {
        self.workers.iter().map(|w| w.counters.active.load(Ordering::Relaxed)).sum()
    }

    pub fn pending_count(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| {
                let submitted = w.counters.submitted.load(Ordering::Relaxed);
                let completed = w.counters.completed.load(Ordering::Relaxed);
                submitted.saturating_sub(completed)
            })
            .sum()
    }

    pub fn total_processed(&self) -> u64 {
        self.workers.iter().map(|w| w.counters.completed.load(Ordering::Relaxed)).sum()
    }

    pub fn total_submitted(&self) -> u64 {
        self.workers.iter().map(|w| w.counters.submitted.load(Ordering::Relaxed)).sum()
    }

    /// Idempotently drains and shuts down every worker. In-flight transfers
    /// already accepted by a worker are allowed to finish (their outcome is
    /// still recorded); no new submissions are possible once this returns.
    pub async fn stop(self) {
        for worker in self.workers {
            drop(worker.sender);
            let _ = worker.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SamplingConfig;
    use std::time::Duration;

    fn noop_pool() -> Arc<HandlePool> {
        Arc::new(HandlePool::new(reqwest::Client::new(), &crate::pool::PoolConfig::default()))
    }

    fn noop_dns_cache() -> Arc<DnsCache> {
        Arc::new(DnsCache::new(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn round_robins_across_workers() {
        let event_loop = EventLoop::spawn(
            3,
            10,
            noop_pool(),
            None,
            Arc::new(MetricsCollector::new(SamplingConfig::default())),
            Arc::from("run_1"),
            noop_dns_cache(),
        );
        assert_eq!(event_loop.workers.len(), 3);
        let first = event_loop.pick_worker() as *const WorkerSlot;
        let second = event_loop.pick_worker() as *const WorkerSlot;
        let third = event_loop.pick_worker() as *const WorkerSlot;
        let fourth = event_loop.pick_worker() as *const WorkerSlot;
        assert_eq!(first, fourth);
        assert_ne!(first, second);
        assert_ne!(second, third);
        event_loop.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_without_hanging() {
        let event_loop = EventLoop::spawn(
            2,
            5,
            noop_pool(),
            None,
            Arc::new(MetricsCollector::new(SamplingConfig::default())),
            Arc::from("run_1"),
            noop_dns_cache(),
        );
        tokio::time::timeout(Duration::from_secs(2), event_loop.stop())
            .await
            .expect("stop should not hang with no in-flight transfers");
    }

    #[tokio::test]
    async fn retarget_rps_updates_every_worker_limiter() {
        let event_loop = EventLoop::spawn(
            2,
            5,
            noop_pool(),
            Some(100.0),
            Arc::new(MetricsCollector::new(SamplingConfig::default())),
            Arc::from("run_1"),
            noop_dns_cache(),
        );
        event_loop.retarget_rps(40.0);
        for worker in &event_loop.workers {
            let limiter = worker.limiter.as_ref().unwrap();
            assert!(!limiter.is_unlimited());
        }
        event_loop.stop().await;
    }
}
