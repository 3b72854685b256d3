//! Drives one Load-mode run from its `RunSpec` to a terminal status.
//!
//! Spawned once per run by the control surface's `POST /run` handler.
//! Generalizes the teacher's `main.rs` top-level loop (build client, spawn
//! workers, run until `LOAD_MODEL` duration elapses, print a final report)
//! into a per-run, per-strategy, store-backed controller instead of a
//! process-lifetime singleton.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::dns::DnsCache;
use crate::error::EngineError;
use crate::event_loop::EventLoop;
use crate::metrics::{MetricsCollector, SamplingConfig};
use crate::model::{now_ms, BodyType, MetricName, MetricSnapshot, RequestBody, RunSpec, RunStatus, VariableMap};
use crate::pool::{HandlePool, PoolConfig};
use crate::run_manager::{RunContext, RunManager};
use crate::store::Store;
use crate::strategy::LoadStrategy;
use crate::substitution::substitute;
use crate::worker::RequestTemplate;

const METRICS_TICK: Duration = Duration::from_secs(1);
const RAMP_RETARGET_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Variable scopes a run resolves its template against, in priority order:
/// request-local, then environment, then globals.
pub struct RunVariables {
    pub environment: VariableMap,
    pub globals: VariableMap,
    pub collection: VariableMap,
}

fn build_template(spec: &RunSpec, vars: &RunVariables) -> Result<RequestTemplate, EngineError> {
    let scopes: [&VariableMap; 3] = [&vars.environment, &vars.globals, &vars.collection];
    let url = substitute(&spec.url, &scopes);
    let parsed = reqwest::Url::parse(&url).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| EngineError::InvalidUrl(url.clone()))?.to_string();

    let headers = spec
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, &scopes)))
        .collect();

    let body = spec.body.as_ref().and_then(|b| resolve_body(b, &scopes));
    let timeout = Duration::from_millis(spec.timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS));

    Ok(RequestTemplate { method: spec.method, url, host, headers, body, timeout })
}

fn resolve_body(body: &RequestBody, scopes: &[&VariableMap; 3]) -> Option<Vec<u8>> {
    match body.body_type {
        BodyType::None => None,
        _ => Some(substitute(&body.content, scopes).into_bytes()),
    }
}

/// Registers a fresh `RunContext` with `run_manager`, spawns the controller
/// task, and attaches its `JoinHandle` to the context — then returns. The
/// caller (the `/run` handler) responds with `202` and the assigned run id
/// without waiting for completion.
#[allow(clippy::too_many_arguments)]
pub async fn spawn(
    run_id: String,
    spec: RunSpec,
    vars: RunVariables,
    store: Arc<Store>,
    run_manager: Arc<RunManager>,
    pool_config: PoolConfig,
    worker_count: usize,
    dns_cache: Arc<DnsCache>,
) {
    let sampling = SamplingConfig {
        success_sample_rate: spec.success_sample_rate.unwrap_or(100),
        slow_threshold_ms: spec.slow_threshold_ms.unwrap_or(1000.0),
    };
    let metrics = Arc::new(MetricsCollector::new(sampling));
    let ctx = Arc::new(RunContext::new(run_id.clone(), metrics.clone()));
    run_manager.register(ctx.clone()).await;

    let run_manager_bg = run_manager.clone();
    let run_id_bg = run_id.clone();
    let ctx_bg = ctx.clone();
    let handle = tokio::spawn(async move {
        run(run_id_bg, spec, vars, store, run_manager_bg, pool_config, worker_count, ctx_bg, metrics, dns_cache).await;
    });
    ctx.set_handle(handle);
}

#[allow(clippy::too_many_arguments)]
async fn run(
    run_id: String,
    spec: RunSpec,
    vars: RunVariables,
    store: Arc<Store>,
    run_manager: Arc<RunManager>,
    pool_config: PoolConfig,
    worker_count: usize,
    ctx: Arc<RunContext>,
    metrics: Arc<MetricsCollector>,
    dns_cache: Arc<DnsCache>,
) {
    let strategy = match LoadStrategy::from_spec(&spec) {
        Ok(s) => s,
        Err(e) => {
            error!(run_id, error = %e, "run controller could not derive a load strategy");
            let _ = store.update_run_status_with_retry(run_id.clone(), RunStatus::Failed, Some(now_ms())).await;
            run_manager.deregister(&run_id).await;
            return;
        }
    };
    let template = match build_template(&spec, &vars) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(run_id, error = %e, "run controller could not resolve the request template");
            let _ = store.update_run_status_with_retry(run_id.clone(), RunStatus::Failed, Some(now_ms())).await;
            run_manager.deregister(&run_id).await;
            return;
        }
    };

    let client = match pool_config.apply_to_builder(reqwest::Client::builder()).build() {
        Ok(c) => c,
        Err(e) => {
            error!(run_id, error = %e, "run controller could not construct an http client");
            let _ = store.update_run_status_with_retry(run_id.clone(), RunStatus::Failed, Some(now_ms())).await;
            run_manager.deregister(&run_id).await;
            return;
        }
    };
    let pool = Arc::new(HandlePool::new(client, &pool_config));

    let worker_count = if worker_count == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    } else {
        worker_count
    };
    let max_concurrent_per_worker = (strategy.concurrency() as usize / worker_count).max(1);
    let initial_rps = strategy.target_rps_at(0.0);

    let event_loop = Arc::new(EventLoop::spawn(
        worker_count,
        max_concurrent_per_worker,
        pool,
        initial_rps,
        metrics.clone(),
        Arc::from(run_id.as_str()),
        dns_cache,
    ));

    ctx.requests_expected.store(strategy.expected_requests(), Ordering::Relaxed);

    let _ = store.update_run_status_with_retry(run_id.clone(), RunStatus::Running, None).await;

    let start = Instant::now();
    let metrics_task = spawn_metrics_tick(run_id.clone(), store.clone(), metrics.clone(), ctx.clone());

    drive(&strategy, &event_loop, &ctx, template, start).await;

    let final_status = if ctx.is_stopping() {
        RunStatus::Stopped
    } else {
        RunStatus::Completed
    };

    match Arc::into_inner(event_loop) {
        Some(event_loop) => {
            if tokio::time::timeout(STOP_GRACE, event_loop.stop()).await.is_err() {
                error!(run_id, "event loop did not drain within the graceful-stop window");
            }
        }
        None => error!(run_id, "event loop still referenced elsewhere; skipped stop"),
    }

    metrics_task.abort();
    write_terminal_snapshots(&store, &run_id, &metrics, start.elapsed()).await;
    if let Err(e) = metrics.flush_to_store(&store).await {
        error!(run_id, error = %e, "failed to flush sampled results to the store");
    }

    let _ = store
        .update_run_status_with_retry(run_id.clone(), final_status, Some(now_ms()))
        .await;
    run_manager.deregister(&run_id).await;
    info!(run_id, status = ?final_status, "run controller finished");
}

async fn drive(
    strategy: &LoadStrategy,
    event_loop: &Arc<EventLoop>,
    ctx: &Arc<RunContext>,
    template: Arc<RequestTemplate>,
    start: Instant,
) {
    let is_ramp = matches!(strategy, LoadStrategy::RampUp { .. });
    let mut last_retarget = Instant::now();
    loop {
        let elapsed = start.elapsed().as_secs_f64();
        let issued = ctx.requests_sent.load(Ordering::Relaxed);
        if ctx.is_stopping() || strategy.is_complete(elapsed, issued) {
            break;
        }
        if is_ramp && last_retarget.elapsed() >= RAMP_RETARGET_INTERVAL {
            if let Some(rps) = strategy.target_rps_at(elapsed) {
                event_loop.retarget_rps(rps);
            }
            last_retarget = Instant::now();
        }
        match event_loop.submit(template.clone()).await {
            Some(_) => {
                ctx.requests_sent.fetch_add(1, Ordering::Relaxed);
            }
            None => break,
        }
    }
}

fn spawn_metrics_tick(
    run_id: String,
    store: Arc<Store>,
    metrics: Arc<MetricsCollector>,
    ctx: Arc<RunContext>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_TICK);
        loop {
            interval.tick().await;
            if ctx.is_stopping() {
                continue;
            }
            let total = metrics.total_requests.load(Ordering::Relaxed) as f64;
            let sent = ctx.requests_sent.load(Ordering::Relaxed);
            let snapshot = MetricSnapshot {
                id: None,
                run_id: run_id.clone(),
                timestamp: now_ms(),
                name: MetricName::RequestsSent,
                value: sent as f64,
                labels: String::new(),
            };
            if let Err(e) = store.insert_metric(snapshot).await {
                error!(run_id, error = %e, "failed to append periodic metric snapshot");
            }
            let _ = total;
        }
    })
}

async fn write_terminal_snapshots(store: &Store, run_id: &str, metrics: &MetricsCollector, elapsed: Duration) {
    let ts = now_ms();
    let mut snapshots = vec![
        MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::TotalRequests, value: metrics.total_requests.load(Ordering::Relaxed) as f64, labels: String::new() },
        MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::TestDuration, value: elapsed.as_secs_f64(), labels: String::new() },
        MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::Completed, value: 1.0, labels: String::new() },
    ];
    if let Some(stats) = metrics.latency_stats() {
        snapshots.push(MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::LatencyP50, value: stats.p50_ms, labels: String::new() });
        snapshots.push(MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::LatencyP75, value: stats.p75_ms, labels: String::new() });
        snapshots.push(MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::LatencyP90, value: stats.p90_ms, labels: String::new() });
        snapshots.push(MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::LatencyP95, value: stats.p95_ms, labels: String::new() });
        snapshots.push(MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::LatencyP99, value: stats.p99_ms, labels: String::new() });
        snapshots.push(MetricSnapshot { id: None, run_id: run_id.to_string(), timestamp: ts, name: MetricName::LatencyP999, value: stats.p999_ms, labels: String::new() });
    }
    let status_codes: HashMap<String, u64> = metrics
        .status_code_counts()
        .into_iter()
        .map(|(code, count)| (code.to_string(), count))
        .collect();
    let total_success = metrics.total_success.load(Ordering::Relaxed);
    let total_failed = metrics.total_failed.load(Ordering::Relaxed);
    let total = total_success + total_failed;
    snapshots.push(MetricSnapshot {
        id: None,
        run_id: run_id.to_string(),
        timestamp: ts,
        name: MetricName::ErrorRate,
        value: if total > 0 { total_failed as f64 / total as f64 } else { 0.0 },
        labels: String::new(),
    });
    // Piggybacks the full status/error breakdown on the one metric name the
    // spec's closed enumeration sets aside for it; `StatusCodes`'s `labels`
    // carries the whole JSON blob rather than one field per new metric name.
    let status_blob = serde_json::json!({
        "codes": status_codes,
        "errorsByType": metrics.error_type_counts(),
        "totalSuccess": total_success,
        "totalFailed": total_failed,
        "slowRequests": metrics.slow_requests.load(Ordering::Relaxed),
    });
    snapshots.push(MetricSnapshot {
        id: None,
        run_id: run_id.to_string(),
        timestamp: ts,
        name: MetricName::StatusCodes,
        value: 0.0,
        labels: status_blob.to_string(),
    });
    if let Err(e) = store.insert_metrics_batch(snapshots).await {
        error!(run_id, error = %e, "failed to write terminal metric snapshots");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpMethod;

    fn empty_vars() -> RunVariables {
        RunVariables { environment: VariableMap::new(), globals: VariableMap::new(), collection: VariableMap::new() }
    }

    fn base_spec() -> RunSpec {
        RunSpec {
            method: HttpMethod::Get,
            url: "http://127.0.0.1:9/{{path}}".into(),
            headers: Default::default(),
            params: Default::default(),
            body: None,
            auth: None,
            pre_request_script: None,
            post_request_script: None,
            request_id: None,
            environment_id: None,
            comment: None,
            mode: None,
            duration: None,
            iterations: None,
            concurrency: None,
            target_rps: None,
            start_concurrency: None,
            ramp_up_duration: None,
            stages: None,
            success_sample_rate: None,
            slow_threshold_ms: None,
            save_timing_breakdown: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn build_template_substitutes_url_variables() {
        let mut spec = base_spec();
        spec.url = "http://127.0.0.1:9/{{path}}".into();
        let mut vars = empty_vars();
        vars.environment.insert("path".into(), crate::model::Variable { value: "ping".into(), enabled: true, secret: false });
        let template = build_template(&spec, &vars).unwrap();
        assert_eq!(template.url, "http://127.0.0.1:9/ping");
        assert_eq!(template.host, "127.0.0.1");
    }

    #[test]
    fn build_template_rejects_unparseable_url() {
        let mut spec = base_spec();
        spec.url = "not a url".into();
        let vars = empty_vars();
        assert!(build_template(&spec, &vars).is_err());
    }

    #[test]
    fn json_body_is_substituted_and_encoded() {
        let mut spec = base_spec();
        spec.body = Some(RequestBody { body_type: BodyType::Json, content: "{\"id\":\"{{id}}\"}".into() });
        let mut vars = empty_vars();
        vars.environment.insert("id".into(), crate::model::Variable { value: "42".into(), enabled: true, secret: false });
        let template = build_template(&spec, &vars).unwrap();
        assert_eq!(template.body.unwrap(), b"{\"id\":\"42\"}".to_vec());
    }
}
