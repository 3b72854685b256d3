//! A single worker: its own submission queue, in-flight set, rate limiter
//! and handle pool.
//!
//! Generalizes the teacher's `run_worker`: the same absolute-time pacing
//! idea now lives in `ratelimiter::TokenBucket` rather than inline
//! `sleep_until` arithmetic, and per-status-code/error-category counting
//! now lives in `metrics::MetricsCollector` rather than a set of
//! `lazy_static` Prometheus vectors. A worker never blocks on the Store or
//! the SSE sink — only on its queue, its pool, and the run's shared
//! `MetricsCollector`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use crate::dns::DnsCache;
use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::model::{now_ms, HttpMethod, ResultRecord};
use crate::pool::HandlePool;
use crate::ratelimiter::TokenBucket;

/// A fully-resolved (post-substitution) request, ready to send repeatedly.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: HttpMethod,
    pub url: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: std::time::Duration,
}

/// One transfer placed on a worker's queue. `completion` is populated only
/// for `submit_async`/`execute_batch` callers awaiting the outcome.
pub struct Transfer {
    pub id: String,
    pub template: Arc<RequestTemplate>,
    pub completion: Option<oneshot::Sender<ResultRecord>>,
}

/// Atomic worker-local counters, summed by the event loop for its
/// aggregate `active_count`/`pending_count`/`total_processed`.
#[derive(Default)]
pub struct WorkerCounters {
    pub submitted: AtomicU64,
    pub active: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

pub struct Worker {
    pub id: usize,
    pub pool: Arc<HandlePool>,
    pub limiter: Option<Arc<TokenBucket>>,
    pub metrics: Arc<MetricsCollector>,
    pub run_id: Arc<str>,
    pub counters: Arc<WorkerCounters>,
    pub dns_cache: Arc<DnsCache>,
}

impl Worker {
    /// Drains `queue` until the channel closes (the event loop's `stop()`
    /// drops its senders). Up to `max_concurrent` transfers run at once;
    /// additional arrivals wait on the in-worker semaphore, mirroring the
    /// "drain into the reactor up to max_concurrent" step of the spec
    /// without requiring a hand-rolled reactor — tokio's own is that
    /// reactor.
    pub async fn run(self, mut queue: mpsc::Receiver<Transfer>, max_concurrent: usize) {
        let worker = Arc::new(self);
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                transfer = queue.recv() => {
                    match transfer {
                        Some(transfer) => {
                            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                            let worker = worker.clone();
                            worker.counters.active.fetch_add(1, Ordering::Relaxed);
                            in_flight.spawn(async move {
                                let _permit = permit;
                                worker.execute(transfer).await;
                            });
                        }
                        None => break,
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
    }

    async fn execute(&self, transfer: Transfer) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire_blocking(1.0).await;
        }
        let record = self.send_once(&transfer.template).await;
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if record.status_code == 0 {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.record_result(record.clone(), &transfer.id);
        if let Some(completion) = transfer.completion {
            let _ = completion.send(record);
        }
    }

    async fn send_once(&self, template: &RequestTemplate) -> ResultRecord {
        let host_port = host_port_of(&template.url, &template.host);
        if let Err(e) = self.dns_cache.resolve(&host_port).await {
            warn!(task_id = self.id, host = %host_port, error = %e, "dns cache resolution failed, falling back to reqwest's own resolver");
        }

        let handle = self.pool.acquire(&template.host).await;
        let started = Instant::now();

        let mut builder = handle
            .client()
            .request(template.method.as_reqwest(), &template.url)
            .timeout(template.timeout);
        if let Some(headers) = build_header_map(&template.headers) {
            builder = builder.headers(headers);
        }
        let bytes_out = template.body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        if let Some(body) = &template.body {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(mut response) => {
                let status = response.status().as_u16();
                let mut bytes_in: u64 = 0;
                while let Ok(Some(chunk)) = response.chunk().await {
                    bytes_in += chunk.len() as u64;
                }
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.pool.release(handle);
                self.counters.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
                self.counters.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
                self.metrics.record_bytes(bytes_in, bytes_out);
                debug!(task_id = self.id, url = %template.url, status, "request completed");
                ResultRecord {
                    run_id: self.run_id.to_string(),
                    timestamp: now_ms(),
                    status_code: status as i32,
                    latency_ms,
                    error: String::new(),
                    trace_data: String::new(),
                }
            }
            Err(e) => {
                self.pool.release_bad(handle);
                let engine_err = EngineError::from_reqwest(&e);
                if matches!(engine_err, EngineError::ConnectionFailed(_) | EngineError::DnsError(_)) {
                    self.dns_cache.invalidate(&host_port);
                }
                warn!(task_id = self.id, url = %template.url, error = %engine_err, "request failed");
                ResultRecord {
                    run_id: self.run_id.to_string(),
                    timestamp: now_ms(),
                    status_code: 0,
                    latency_ms: 0.0,
                    error: engine_err.to_string(),
                    trace_data: String::new(),
                }
            }
        }
    }
}

/// Derives the `host:port` key the DNS cache is keyed by, falling back to
/// `host` alone with no default port guess if the URL fails to parse (it
/// already parsed once when the template was built, so this only happens
/// for hand-built templates in tests).
pub(crate) fn host_port_of(url: &str, host: &str) -> String {
    match reqwest::Url::parse(url).ok().and_then(|u| u.port_or_known_default()) {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn build_header_map(headers: &[(String, String)]) -> Option<HeaderMap> {
    if headers.is_empty() {
        return None;
    }
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        match (HeaderName::try_from(k.as_str()), HeaderValue::try_from(v.as_str())) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %k, "skipping unparseable header"),
        }
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_skips_invalid_entries_without_panicking() {
        let headers = vec![
            ("X-Valid".to_string(), "ok".to_string()),
            ("Invalid Header Name".to_string(), "x".to_string()),
        ];
        let map = build_header_map(&headers).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn empty_headers_produce_no_map() {
        assert!(build_header_map(&[]).is_none());
    }
}
