//! Hot-path metrics collector.
//!
//! Constructed once per run. Every field on the completion path is an
//! atomic or a pre-sized structure; the percentile machinery is the
//! teacher's `PercentileTracker` (HdrHistogram, 1us-60s, 3 significant
//! digits) lifted out of a `lazy_static` global into a value owned by the
//! run's context, per the anti-singleton redesign note.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use hdrhistogram::Histogram;
use tracing::warn;

use crate::error::ErrorCategory;
use crate::model::ResultRecord;

const DEFAULT_SAMPLE_RING_CAPACITY: usize = 64 * 1024;

pub struct PercentileStats {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p999_ms: f64,
}

struct LatencyHistogram {
    histogram: Mutex<Histogram<u64>>,
}

impl LatencyHistogram {
    fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3).expect("valid histogram bounds");
        Self { histogram: Mutex::new(histogram) }
    }

    fn record_ms(&self, latency_ms: f64) {
        let us = (latency_ms * 1000.0).round().clamp(1.0, 60_000_000.0) as u64;
        let mut hist = self.histogram.lock().unwrap();
        if let Err(e) = hist.record(us) {
            warn!(error = %e, "failed to record latency sample");
        }
    }

    fn stats(&self) -> Option<PercentileStats> {
        let hist = self.histogram.lock().unwrap();
        if hist.is_empty() {
            return None;
        }
        let to_ms = |us: u64| us as f64 / 1000.0;
        Some(PercentileStats {
            count: hist.len(),
            min_ms: to_ms(hist.min()),
            max_ms: to_ms(hist.max()),
            mean_ms: hist.mean() / 1000.0,
            p50_ms: to_ms(hist.value_at_quantile(0.50)),
            p75_ms: to_ms(hist.value_at_quantile(0.75)),
            p90_ms: to_ms(hist.value_at_quantile(0.90)),
            p95_ms: to_ms(hist.value_at_quantile(0.95)),
            p99_ms: to_ms(hist.value_at_quantile(0.99)),
            p999_ms: to_ms(hist.value_at_quantile(0.999)),
        })
    }
}

/// Deterministic counter-based sampling: an even distribution across
/// requests without cross-worker coordination or shared RNG state.
fn hash_mod_100(key: &str) -> u64 {
    let mut acc: u64 = 0xcbf29ce484222325;
    for b in key.as_bytes() {
        acc ^= *b as u64;
        acc = acc.wrapping_mul(0x100000001b3);
    }
    acc % 100
}

pub struct SamplingConfig {
    pub success_sample_rate: u8,
    pub slow_threshold_ms: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { success_sample_rate: 100, slow_threshold_ms: 1000.0 }
    }
}

struct SampleRing {
    capacity: usize,
    successes: VecDeque<ResultRecord>,
    errors_and_slow: VecDeque<ResultRecord>,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self { capacity, successes: VecDeque::new(), errors_and_slow: VecDeque::new() }
    }

    fn push(&mut self, record: ResultRecord, is_error_or_slow: bool) {
        if is_error_or_slow {
            self.errors_and_slow.push_back(record);
        } else {
            if self.successes.len() + self.errors_and_slow.len() >= self.capacity {
                self.successes.pop_front();
            }
            self.successes.push_back(record);
        }
    }

    fn drain_all(&mut self) -> Vec<ResultRecord> {
        let mut all: Vec<ResultRecord> = self.errors_and_slow.drain(..).collect();
        all.extend(self.successes.drain(..));
        all
    }

    fn sample(&self, limit: usize) -> Vec<ResultRecord> {
        self.errors_and_slow
            .iter()
            .chain(self.successes.iter())
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Per-run hot-path metrics state. No allocation occurs on `record_result`
/// except for the (rare, sampled) push into the result ring.
pub struct MetricsCollector {
    pub total_requests: AtomicU64,
    pub total_success: AtomicU64,
    pub total_failed: AtomicU64,
    pub slow_requests: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    status_code_counts: Mutex<HashMap<i32, u64>>,
    error_type_counts: Mutex<HashMap<&'static str, u64>>,
    latency: LatencyHistogram,
    sampling: SamplingConfig,
    ring: Mutex<SampleRing>,
    start: std::time::Instant,
}

impl MetricsCollector {
    pub fn new(sampling: SamplingConfig) -> Self {
        Self::with_ring_capacity(sampling, DEFAULT_SAMPLE_RING_CAPACITY)
    }

    pub fn with_ring_capacity(sampling: SamplingConfig, ring_capacity: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_success: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            slow_requests: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            status_code_counts: Mutex::new(HashMap::new()),
            error_type_counts: Mutex::new(HashMap::new()),
            latency: LatencyHistogram::new(),
            sampling,
            ring: Mutex::new(SampleRing::new(ring_capacity)),
            start: std::time::Instant::now(),
        }
    }

    /// Records the outcome of one request. Called from worker completion
    /// callbacks; never touches the Store or the SSE sink directly.
    pub fn record_result(&self, record: ResultRecord, request_id: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let is_error = record.status_code == 0;
        if is_error {
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            let category = classify_error_label(&record.error);
            let mut counts = self.error_type_counts.lock().unwrap();
            *counts.entry(category).or_insert(0) += 1;
        } else {
            self.total_success.fetch_add(1, Ordering::Relaxed);
            self.latency.record_ms(record.latency_ms);
        }

        {
            let mut counts = self.status_code_counts.lock().unwrap();
            *counts.entry(record.status_code).or_insert(0) += 1;
        }

        let is_slow = record.latency_ms >= self.sampling.slow_threshold_ms;
        if is_slow {
            self.slow_requests.fetch_add(1, Ordering::Relaxed);
        }
        let should_sample = is_error
            || is_slow
            || hash_mod_100(request_id) < self.sampling.success_sample_rate as u64;
        if should_sample {
            let mut ring = self.ring.lock().unwrap();
            ring.push(record, is_error || is_slow);
        }
    }

    pub fn record_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn latency_stats(&self) -> Option<PercentileStats> {
        self.latency.stats()
    }

    pub fn status_code_counts(&self) -> HashMap<i32, u64> {
        self.status_code_counts.lock().unwrap().clone()
    }

    pub fn error_type_counts(&self) -> HashMap<&'static str, u64> {
        self.error_type_counts.lock().unwrap().clone()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Instantaneous snapshot used by the live SSE channel.
    pub fn current_stats(&self, active_count: u64, requests_sent: u64) -> serde_json::Value {
        let elapsed_s = self.elapsed().as_secs_f64().max(0.001);
        let total = self.total_requests.load(Ordering::Relaxed);
        let success = self.total_success.load(Ordering::Relaxed);
        let failed = self.total_failed.load(Ordering::Relaxed);
        let latency = self.latency_stats();
        serde_json::json!({
            "requestsSent": requests_sent,
            "totalRequests": total,
            "totalSuccess": success,
            "totalFailed": failed,
            "activeConnections": active_count,
            "rps": total as f64 / elapsed_s,
            "errorRate": if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            "backpressure": requests_sent as i64 - total as i64,
            "latency": latency.map(|s| serde_json::json!({
                "mean": s.mean_ms, "p50": s.p50_ms, "p75": s.p75_ms,
                "p90": s.p90_ms, "p95": s.p95_ms, "p99": s.p99_ms, "p999": s.p999_ms,
            })),
        })
    }

    /// Sampled results for the report endpoint (up to `limit`).
    pub fn sample_results(&self, limit: usize) -> Vec<ResultRecord> {
        self.ring.lock().unwrap().sample(limit)
    }

    /// Drains every sampled result, for the end-of-run batch flush.
    pub fn drain_results(&self) -> Vec<ResultRecord> {
        self.ring.lock().unwrap().drain_all()
    }

    /// Drains the sample ring and writes it to the store in a single
    /// transaction. Called once, at the end of a run.
    pub async fn flush_to_store(&self, store: &crate::store::Store) -> Result<(), crate::error::EngineError> {
        let results = self.drain_results();
        store.batch_insert_results(results).await
    }
}

fn classify_error_label(error: &str) -> &'static str {
    let lower = error.to_lowercase();
    if lower.contains("timeout") {
        ErrorCategory::Timeout.label()
    } else if lower.contains("dns") {
        ErrorCategory::DnsError.label()
    } else if lower.contains("tls") || lower.contains("ssl") || lower.contains("certificate") {
        ErrorCategory::TlsError.label()
    } else if lower.contains("cancel") {
        ErrorCategory::Cancelled.label()
    } else if lower.contains("connect") {
        ErrorCategory::ConnectionFailed.label()
    } else {
        ErrorCategory::Other.label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_record(ms: f64) -> ResultRecord {
        ResultRecord {
            run_id: "run_1".into(),
            timestamp: 0,
            status_code: 200,
            latency_ms: ms,
            error: String::new(),
            trace_data: String::new(),
        }
    }

    fn err_record(message: &str) -> ResultRecord {
        ResultRecord {
            run_id: "run_1".into(),
            timestamp: 0,
            status_code: 0,
            latency_ms: 0.0,
            error: message.to_string(),
            trace_data: String::new(),
        }
    }

    #[test]
    fn success_and_failure_counts_sum_to_total() {
        let collector = MetricsCollector::new(SamplingConfig::default());
        for _ in 0..7 {
            collector.record_result(ok_record(10.0), "a");
        }
        collector.record_result(err_record("Timeout"), "b");
        let total: u64 = collector.status_code_counts().values().sum();
        assert_eq!(total, 8);
        assert_eq!(collector.total_success.load(Ordering::Relaxed), 7);
        assert_eq!(collector.total_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn errors_are_always_sampled_successes_are_rate_limited() {
        let collector = MetricsCollector::new(SamplingConfig { success_sample_rate: 0, slow_threshold_ms: 1000.0 });
        for i in 0..20 {
            collector.record_result(ok_record(5.0), &format!("req-{i}"));
        }
        collector.record_result(err_record("Timeout"), "errored");
        let samples = collector.sample_results(100);
        assert_eq!(samples.iter().filter(|r| r.status_code == 0).count(), 1);
    }

    #[test]
    fn slow_successes_are_always_sampled() {
        let collector = MetricsCollector::new(SamplingConfig { success_sample_rate: 0, slow_threshold_ms: 50.0 });
        collector.record_result(ok_record(500.0), "slow-one");
        let samples = collector.sample_results(10);
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn latency_stats_absent_with_no_samples() {
        let collector = MetricsCollector::new(SamplingConfig::default());
        assert!(collector.latency_stats().is_none());
    }

    #[test]
    fn error_result_has_zero_latency() {
        let record = err_record("Timeout");
        assert_eq!(record.status_code, 0);
        assert_eq!(record.latency_ms, 0.0);
        assert_ne!(record.error, "");
    }
}
