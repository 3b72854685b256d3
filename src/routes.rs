//! Route handlers for the control surface.
//!
//! One pure-ish function per endpoint over `(request, AppState)`, following
//! the teacher's `metrics_handler(req, registry)` shape in `main.rs`, just
//! generalized from a single scrape endpoint to the full table in spec.md
//! §6. Every handler returns a `hyper::Response<Body>`; JSON error bodies
//! follow the closed `{"error":{"code","message"}}` envelope `EngineError`
//! already knows how to render.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{error, warn};

use crate::app::AppState;
use crate::error::EngineError;
use crate::model::{
    generate_id, now_ms, Collection, Environment, Globals, HttpMethod, RequestDef, Run, RunSpec,
    RunStatus, RunType,
};
use crate::pool::HandlePool;
use crate::run_controller::{self, RunVariables};
use crate::substitution::substitute;
use crate::worker::RequestTemplate;

fn json_ok(status: StatusCode, value: impl serde::Serialize) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap_or_default()))
        .unwrap()
}

fn error_response(err: EngineError) -> Response<Body> {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": { "code": err.code(), "message": err.to_string() } });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap_or_default()))
        .unwrap()
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, EngineError> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::InvalidJson(e.to_string()))
}

fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let query = req.uri().query()?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

/// Top-level dispatch, matched by method and path segments. Mirrors the
/// teacher's single `service_fn` closure, just with a router in front of
/// it instead of one hardcoded handler.
pub async fn dispatch(req: Request<Body>, state: Arc<AppState>) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => health(&state),
        (&Method::POST, ["shutdown"]) => shutdown(&state),
        (&Method::GET, ["config"]) => list_config(&state),
        (&Method::POST, ["config"]) => update_config(req, &state).await,
        (&Method::GET, ["collections"]) => list_collections(&state).await,
        (&Method::POST, ["collections"]) => save_collection(req, &state).await,
        (&Method::DELETE, ["collections", id]) => delete_collection(id, &state).await,
        (&Method::GET, ["requests"]) => list_requests(&req, &state).await,
        (&Method::POST, ["requests"]) => save_request(req, &state).await,
        (&Method::DELETE, ["requests", id]) => delete_request(id, &state).await,
        (&Method::GET, ["environments"]) => list_environments(&state).await,
        (&Method::POST, ["environments"]) => save_environment(req, &state).await,
        (&Method::DELETE, ["environments", id]) => delete_environment(id, &state).await,
        (&Method::GET, ["globals"]) => get_globals(&state).await,
        (&Method::POST, ["globals"]) => save_globals(req, &state).await,
        (&Method::POST, ["request"]) => design_mode_request(req, &state).await,
        (&Method::POST, ["run"]) => start_run(req, &state).await,
        (&Method::GET, ["runs"]) => list_runs(&state).await,
        (&Method::GET, ["run", id]) => get_run(id, &state).await,
        (&Method::DELETE, ["run", id]) => delete_run(id, &state).await,
        (&Method::POST, ["run", id, "stop"]) => stop_run(id, &state).await,
        (&Method::GET, ["run", id, "report"]) => run_report(id, &state).await,
        (&Method::GET, ["stats", id]) => stats_stream(&req, id, &state).await,
        (&Method::GET, ["metrics", "live", id]) => live_metrics_stream(id, &state).await,
        (&Method::GET, ["scripting", "completions"]) => scripting_completions(),
        _ => error_response(EngineError::InvalidRequest(format!("no route for {method} {path}"))),
    };
    Ok(response)
}

fn health(state: &AppState) -> Response<Body> {
    json_ok(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "workers": state.config.get_u64("workers"),
        }),
    )
}

fn shutdown(_state: &AppState) -> Response<Body> {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    json_ok(StatusCode::OK, serde_json::json!({ "status": "shutting_down" }))
}

fn list_config(state: &AppState) -> Response<Body> {
    json_ok(StatusCode::OK, state.config.list())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigUpdate {
    Batch { entries: HashMap<String, f64> },
    Single { key: String, value: f64 },
}

async fn update_config(req: Request<Body>, state: &AppState) -> Response<Body> {
    let update: ConfigUpdate = match read_json(req).await {
        Ok(u) => u,
        Err(e) => return error_response(e),
    };
    let result = match update {
        ConfigUpdate::Batch { entries } => entries
            .into_iter()
            .try_for_each(|(key, value)| state.config.set(&key, value).map(|_| ())),
        ConfigUpdate::Single { key, value } => state.config.set(&key, value).map(|_| ()),
    };
    match result {
        Ok(()) => json_ok(StatusCode::OK, state.config.list()),
        Err(e) => error_response(EngineError::InvalidRequest(e.to_string())),
    }
}

async fn list_collections(state: &AppState) -> Response<Body> {
    match state.store.list_collections().await {
        Ok(collections) => json_ok(StatusCode::OK, collections),
        Err(e) => error_response(e),
    }
}

async fn save_collection(req: Request<Body>, state: &AppState) -> Response<Body> {
    #[derive(Deserialize)]
    struct Body_ {
        id: Option<String>,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        name: String,
        #[serde(default)]
        order: i64,
        #[serde(default)]
        variables: crate::model::VariableMap,
    }
    let incoming: Body_ = match read_json(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    let now = now_ms();
    let collection = Collection {
        id: incoming.id.unwrap_or_else(|| generate_id("col")),
        parent_id: incoming.parent_id,
        name: incoming.name,
        order: incoming.order,
        variables: incoming.variables,
        created_at: now,
        updated_at: now,
    };
    match state.store.save_collection(collection.clone()).await {
        Ok(()) => json_ok(StatusCode::OK, collection),
        Err(e) => error_response(e),
    }
}

async fn delete_collection(id: &str, state: &AppState) -> Response<Body> {
    match state.store.delete_collection(id.to_string()).await {
        Ok(()) => json_ok(StatusCode::OK, serde_json::json!({ "deleted": id })),
        Err(e) => error_response(e),
    }
}

async fn list_requests(req: &Request<Body>, state: &AppState) -> Response<Body> {
    let collection_id = query_param(req, "collectionId");
    match state.store.list_requests(collection_id).await {
        Ok(requests) => json_ok(StatusCode::OK, requests),
        Err(e) => error_response(e),
    }
}

async fn save_request(req: Request<Body>, state: &AppState) -> Response<Body> {
    #[derive(Deserialize)]
    struct Body_ {
        id: Option<String>,
        #[serde(rename = "collectionId")]
        collection_id: String,
        name: String,
        method: HttpMethod,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        params: HashMap<String, String>,
        #[serde(default)]
        body: crate::model::RequestBody,
        #[serde(default)]
        auth: Option<serde_json::Value>,
        #[serde(rename = "preScript", default)]
        pre_script: Option<String>,
        #[serde(rename = "postScript", default)]
        post_script: Option<String>,
    }
    let incoming: Body_ = match read_json(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    let now = now_ms();
    let request = RequestDef {
        id: incoming.id.unwrap_or_else(|| generate_id("req")),
        collection_id: incoming.collection_id,
        name: incoming.name,
        method: incoming.method,
        url: incoming.url,
        headers: incoming.headers,
        params: incoming.params,
        body: incoming.body,
        auth: incoming.auth,
        pre_script: incoming.pre_script,
        post_script: incoming.post_script,
        created_at: now,
        updated_at: now,
    };
    match state.store.save_request(request.clone()).await {
        Ok(()) => json_ok(StatusCode::OK, request),
        Err(e) => error_response(e),
    }
}

async fn delete_request(id: &str, state: &AppState) -> Response<Body> {
    match state.store.delete_request(id.to_string()).await {
        Ok(()) => json_ok(StatusCode::OK, serde_json::json!({ "deleted": id })),
        Err(e) => error_response(e),
    }
}

async fn list_environments(state: &AppState) -> Response<Body> {
    match state.store.list_environments().await {
        Ok(envs) => json_ok(StatusCode::OK, envs),
        Err(e) => error_response(e),
    }
}

async fn save_environment(req: Request<Body>, state: &AppState) -> Response<Body> {
    #[derive(Deserialize)]
    struct Body_ {
        id: Option<String>,
        name: String,
        #[serde(default)]
        variables: crate::model::VariableMap,
    }
    let incoming: Body_ = match read_json(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    let environment = Environment {
        id: incoming.id.unwrap_or_else(|| generate_id("env")),
        name: incoming.name,
        variables: incoming.variables,
        updated_at: now_ms(),
    };
    match state.store.save_environment(environment.clone()).await {
        Ok(()) => json_ok(StatusCode::OK, environment),
        Err(e) => error_response(e),
    }
}

async fn delete_environment(id: &str, state: &AppState) -> Response<Body> {
    match state.store.delete_environment(id.to_string()).await {
        Ok(()) => json_ok(StatusCode::OK, serde_json::json!({ "deleted": id })),
        Err(e) => error_response(e),
    }
}

async fn get_globals(state: &AppState) -> Response<Body> {
    match state.store.get_globals().await {
        Ok(globals) => json_ok(StatusCode::OK, globals),
        Err(e) => error_response(e),
    }
}

async fn save_globals(req: Request<Body>, state: &AppState) -> Response<Body> {
    let variables: crate::model::VariableMap = match read_json(req).await {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let globals = Globals { id: Globals::ID.to_string(), variables, updated_at: now_ms() };
    match state.store.save_globals(globals.clone()).await {
        Ok(()) => json_ok(StatusCode::OK, globals),
        Err(e) => error_response(e),
    }
}

fn scopes_from(environment: &crate::model::VariableMap, globals: &crate::model::VariableMap) -> [crate::model::VariableMap; 2] {
    [environment.clone(), globals.clone()]
}

/// Resolves the environment/globals scopes a `RunSpec.environmentId`
/// selects, falling back to empty maps when absent.
async fn resolve_scopes(state: &AppState, environment_id: Option<&str>) -> RunVariables {
    let globals = state.store.get_globals().await.map(|g| g.variables).unwrap_or_default();
    let environment = match environment_id {
        Some(id) => state
            .store
            .list_environments()
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.variables)
            .unwrap_or_default(),
        None => Default::default(),
    };
    RunVariables { environment, globals, collection: Default::default() }
}

/// Executes one request synchronously end-to-end: run the pre-request
/// script, resolve variables, send, run the post-request script, store a
/// single `Result`, return the response. Design-mode variable writes made
/// by either script are persisted back into their owning scopes; Load-mode
/// runs never call `persist_design_mode_writes`.
async fn design_mode_request(req: Request<Body>, state: &AppState) -> Response<Body> {
    let spec: RunSpec = match read_json(req).await {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let mut vars = resolve_scopes(state, spec.environment_id.as_deref()).await;

    let mut ctx = crate::sandbox::ScriptContext {
        request: serde_json::json!({
            "method": spec.method,
            "url": spec.url,
            "headers": spec.headers,
        }),
        response: None,
        environment: vars.environment.clone(),
        globals: vars.globals.clone(),
        collection_vars: vars.collection.clone(),
    };
    let mut tests = Vec::new();
    if let Some(script) = spec.pre_request_script.as_deref() {
        let result = state.sandbox.run(script, &mut ctx).await;
        tests.extend(result.tests);
    }
    vars.environment = ctx.environment.clone();
    vars.globals = ctx.globals.clone();

    let scopes = scopes_from(&vars.environment, &vars.globals);
    let scope_refs: Vec<&crate::model::VariableMap> = scopes.iter().collect();

    let url = substitute(&spec.url, &scope_refs);
    let parsed = match reqwest::Url::parse(&url) {
        Ok(u) => u,
        Err(e) => return error_response(EngineError::InvalidUrl(e.to_string())),
    };
    let host = parsed.host_str().unwrap_or_default().to_string();

    let headers: Vec<(String, String)> = spec
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, &scope_refs)))
        .collect();
    let body = spec.body.as_ref().and_then(|b| match b.body_type {
        crate::model::BodyType::None => None,
        _ => Some(substitute(&b.content, &scope_refs).into_bytes()),
    });
    let timeout = Duration::from_millis(spec.timeout_ms.unwrap_or(30_000));
    let template = RequestTemplate { method: spec.method, url, host, headers, body, timeout };

    let run_id = generate_id("run");
    let run = Run {
        id: run_id.clone(),
        run_type: RunType::Design,
        status: RunStatus::Running,
        request_id: spec.request_id.clone(),
        environment_id: spec.environment_id.clone(),
        config_snapshot: "{}".into(),
        start_time: now_ms(),
        end_time: None,
    };
    if let Err(e) = state.store.create_run(run).await {
        return error_response(e);
    }

    let pool_config = state.pool_config();
    let client = pool_config
        .apply_to_builder(reqwest::Client::builder())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());
    let pool = Arc::new(HandlePool::new(client, &pool_config));
    let host_port = crate::worker::host_port_of(&template.url, &template.host);
    if let Err(e) = state.dns_cache.resolve(&host_port).await {
        warn!(run_id, host = %host_port, error = %e, "dns cache resolution failed for design-mode request");
    }
    let handle = pool.acquire(&template.host).await;
    let started = std::time::Instant::now();
    let mut builder = handle.client().request(template.method.as_reqwest(), &template.url).timeout(template.timeout);
    for (k, v) in &template.headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    if let Some(body) = &template.body {
        builder = builder.body(body.clone());
    }

    let (status_code, latency_ms, error, response_body, response_headers) = match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();
            let text = response.text().await.unwrap_or_default();
            (status as i32, started.elapsed().as_secs_f64() * 1000.0, String::new(), text, headers)
        }
        Err(e) => {
            let engine_err = EngineError::from_reqwest(&e);
            if matches!(engine_err, EngineError::ConnectionFailed(_) | EngineError::DnsError(_)) {
                state.dns_cache.invalidate(&host_port);
            }
            warn!(run_id, error = %engine_err, "design-mode request failed");
            (0, 0.0, engine_err.to_string(), String::new(), HashMap::new())
        }
    };

    ctx.response = Some(crate::sandbox::response_snapshot(status_code as u16, &response_headers, &response_body));
    if let Some(script) = spec.post_request_script.as_deref() {
        let result = state.sandbox.run(script, &mut ctx).await;
        tests.extend(result.tests);
    }
    vars.environment = ctx.environment.clone();
    vars.globals = ctx.globals.clone();
    persist_design_mode_result(state, spec.environment_id.as_deref(), &ctx).await;

    let result = crate::model::ResultRecord {
        run_id: run_id.clone(),
        timestamp: now_ms(),
        status_code,
        latency_ms,
        error: error.clone(),
        trace_data: serde_json::json!({ "url": template.url }).to_string(),
    };
    if let Err(e) = state.store.add_result(result).await {
        error!(run_id, error = %e, "failed to persist design-mode result");
    }
    let _ = state
        .store
        .update_run_status_with_retry(run_id.clone(), RunStatus::Completed, Some(now_ms()))
        .await;

    json_ok(
        StatusCode::OK,
        serde_json::json!({
            "runId": run_id,
            "statusCode": status_code,
            "latencyMs": latency_ms,
            "error": error,
            "body": response_body,
            "tests": tests,
        }),
    )
}

/// Writes Design-mode script scope mutations back to the environment and
/// globals rows they came from. Called once per request, after both
/// scripts have run.
async fn persist_design_mode_result(state: &AppState, environment_id: Option<&str>, ctx: &crate::sandbox::ScriptContext) {
    let mut globals = state.store.get_globals().await.unwrap_or_else(|_| crate::model::Globals::empty(now_ms()));
    let mut environment = match environment_id {
        Some(id) => state
            .store
            .list_environments()
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|e| e.id == id),
        None => None,
    };
    let mut env_vars = environment.as_ref().map(|e| e.variables.clone()).unwrap_or_default();
    let mut global_vars = globals.variables.clone();
    crate::sandbox::persist_design_mode_writes(ctx, &mut env_vars, &mut global_vars);

    globals.variables = global_vars;
    globals.updated_at = now_ms();
    if let Err(e) = state.store.save_globals(globals).await {
        error!(error = %e, "failed to persist design-mode globals writes");
    }
    if let Some(env) = environment.as_mut() {
        env.variables = env_vars;
        env.updated_at = now_ms();
        if let Err(e) = state.store.save_environment(env.clone()).await {
            error!(error = %e, "failed to persist design-mode environment writes");
        }
    }
}

async fn start_run(req: Request<Body>, state: &AppState) -> Response<Body> {
    let spec: RunSpec = match read_json(req).await {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    if let Err(e) = crate::strategy::LoadStrategy::from_spec(&spec) {
        return error_response(e.into());
    }
    let vars = resolve_scopes(state, spec.environment_id.as_deref()).await;

    let run_id = generate_id("run");
    let config_snapshot = serde_json::to_string(&spec.success_sample_rate).unwrap_or_default();
    let run = Run {
        id: run_id.clone(),
        run_type: RunType::Load,
        status: RunStatus::Pending,
        request_id: spec.request_id.clone(),
        environment_id: spec.environment_id.clone(),
        config_snapshot,
        start_time: now_ms(),
        end_time: None,
    };
    if let Err(e) = state.store.create_run(run).await {
        return error_response(e);
    }

    let worker_count = state.config.get_u64("workers") as usize;
    run_controller::spawn(
        run_id.clone(),
        spec,
        vars,
        state.store.clone(),
        state.run_manager.clone(),
        state.pool_config(),
        worker_count,
        state.dns_cache.clone(),
    )
    .await;

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&serde_json::json!({
                "runId": run_id,
                "status": "pending",
                "message": "run accepted",
            }))
            .unwrap_or_default(),
        ))
        .unwrap()
}

async fn list_runs(state: &AppState) -> Response<Body> {
    match state.store.list_runs().await {
        Ok(runs) => json_ok(StatusCode::OK, runs),
        Err(e) => error_response(e),
    }
}

async fn get_run(id: &str, state: &AppState) -> Response<Body> {
    match state.store.get_run(id.to_string()).await {
        Ok(Some(run)) => json_ok(StatusCode::OK, run),
        Ok(None) => error_response(EngineError::RunNotFound(id.to_string())),
        Err(e) => error_response(e),
    }
}

async fn delete_run(id: &str, state: &AppState) -> Response<Body> {
    match state.store.delete_run(id.to_string()).await {
        Ok(()) => json_ok(StatusCode::OK, serde_json::json!({ "deleted": id })),
        Err(e) => error_response(e),
    }
}

async fn stop_run(id: &str, state: &AppState) -> Response<Body> {
    match state.run_manager.stop(id).await {
        Some(status) => json_ok(StatusCode::OK, serde_json::json!({ "runId": id, "status": status })),
        None => {
            match state.store.get_run(id.to_string()).await {
                Ok(Some(run)) if run.status.is_terminal() => {
                    json_ok(StatusCode::OK, serde_json::json!({ "status": "already_stopped" }))
                }
                _ => json_ok(StatusCode::OK, serde_json::json!({ "status": "not_running" })),
            }
        }
    }
}

/// Full terminal report: metadata, summary, latency percentiles, status
/// code distribution, errors grouped by type and by status, timing
/// breakdown, slow-request counts, test-validation totals, and up to 100
/// sampled results. Everything but the sample window is read from the
/// finalized terminal `MetricSnapshot`s the run controller writes once at
/// the end of a run, not from the 100-row sample.
async fn run_report(id: &str, state: &AppState) -> Response<Body> {
    let run = match state.store.get_run(id.to_string()).await {
        Ok(Some(r)) => r,
        Ok(None) => return error_response(EngineError::RunNotFound(id.to_string())),
        Err(e) => return error_response(e),
    };
    let samples = state.store.sample_results(id.to_string(), 100).await.unwrap_or_default();
    let snapshots = state.store.get_metrics_paginated(id.to_string(), 1000, 0).await.unwrap_or_default();

    let total_requests = latest_value(&snapshots, crate::model::MetricName::TotalRequests).unwrap_or(0.0) as u64;
    let test_duration_ms = latest_value(&snapshots, crate::model::MetricName::TestDuration).map(|s| s * 1000.0);
    let setup_overhead_ms = latest_value(&snapshots, crate::model::MetricName::SetupOverhead);
    let tests_passed = latest_value(&snapshots, crate::model::MetricName::TestsPassed).unwrap_or(0.0) as u64;
    let tests_failed = latest_value(&snapshots, crate::model::MetricName::TestsFailed).unwrap_or(0.0) as u64;
    let tests_sampled = latest_value(&snapshots, crate::model::MetricName::TestsSampled).unwrap_or(0.0) as u64;

    let status_blob: serde_json::Value = snapshots
        .iter()
        .rev()
        .find(|m| m.name == crate::model::MetricName::StatusCodes)
        .and_then(|m| serde_json::from_str(&m.labels).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    let status_codes = status_blob.get("codes").cloned().unwrap_or_else(|| serde_json::json!({}));
    let errors_by_type = status_blob.get("errorsByType").cloned().unwrap_or_else(|| serde_json::json!({}));
    let total_success = status_blob.get("totalSuccess").and_then(|v| v.as_u64()).unwrap_or(0);
    let total_failed = status_blob.get("totalFailed").and_then(|v| v.as_u64()).unwrap_or(0);
    let slow_requests = status_blob.get("slowRequests").and_then(|v| v.as_u64()).unwrap_or(0);

    let errors_by_status: HashMap<String, u64> = match &status_codes {
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(code, _)| *code == "0")
            .filter_map(|(code, count)| Some((code.clone(), count.as_u64()?)))
            .collect(),
        _ => HashMap::new(),
    };

    let latency = PERCENTILE_METRICS.iter().fold(serde_json::Map::new(), |mut acc, (key, name)| {
        if let Some(v) = latest_value(&snapshots, *name) {
            acc.insert((*key).to_string(), serde_json::json!(v));
        }
        acc
    });

    let error_rate = if total_requests > 0 { total_failed as f64 / total_requests as f64 } else { 0.0 };

    json_ok(
        StatusCode::OK,
        serde_json::json!({
            "run": run,
            "summary": {
                "totalRequests": total_requests,
                "successCount": total_success,
                "failureCount": total_failed,
                "errorRate": error_rate,
            },
            "latency": if latency.is_empty() { serde_json::Value::Null } else { serde_json::Value::Object(latency) },
            "statusCodes": status_codes,
            "errorsByStatusCode": errors_by_status,
            "errorsByType": errors_by_type,
            "timing": {
                "testDurationMs": test_duration_ms,
                "setupOverheadMs": setup_overhead_ms,
            },
            "slowRequestCount": slow_requests,
            "testTotals": {
                "passed": tests_passed,
                "failed": tests_failed,
                "sampled": tests_sampled,
            },
            "sampledResults": samples,
        }),
    )
}

const PERCENTILE_METRICS: &[(&str, crate::model::MetricName)] = &[
    ("p50", crate::model::MetricName::LatencyP50),
    ("p75", crate::model::MetricName::LatencyP75),
    ("p90", crate::model::MetricName::LatencyP90),
    ("p95", crate::model::MetricName::LatencyP95),
    ("p99", crate::model::MetricName::LatencyP99),
    ("p999", crate::model::MetricName::LatencyP999),
];

/// Last-written value for `name` among a run's terminal snapshots (there is
/// exactly one per name per run today, but `rev().find()` stays correct if
/// a future caller ever writes more than one).
fn latest_value(snapshots: &[crate::model::MetricSnapshot], name: crate::model::MetricName) -> Option<f64> {
    snapshots.iter().rev().find(|m| m.name == name).map(|m| m.value)
}

/// `?format=json` serves a paginated historical read over the store; the
/// default serves a live SSE stream of `current_stats` until the run's
/// `RunContext` is deregistered, then emits a terminal `complete` event.
async fn stats_stream(req: &Request<Body>, id: &str, state: &AppState) -> Response<Body> {
    if query_param(req, "format").as_deref() == Some("json") {
        let limit: i64 = query_param(req, "limit").and_then(|v| v.parse().ok()).unwrap_or(100);
        let offset: i64 = query_param(req, "offset").and_then(|v| v.parse().ok()).unwrap_or(0);
        return match state.store.get_metrics_paginated(id.to_string(), limit, offset).await {
            Ok(snapshots) => json_ok(StatusCode::OK, snapshots),
            Err(e) => error_response(e),
        };
    }

    let run_id = id.to_string();
    let run_manager = state.run_manager.clone();
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        loop {
            match run_manager.get(&run_id).await {
                Some(ctx) => {
                    let (sent, _expected) = ctx.progress();
                    let stats = ctx.metrics.current_stats(0, sent);
                    let chunk = format!("event: metrics\ndata: {}\n\n", stats);
                    if sender.send_data(chunk.into()).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                None => {
                    let payload = serde_json::json!({ "event": "complete", "runId": run_id, "status": "completed" });
                    let chunk = format!("event: complete\ndata: {}\n\n", payload);
                    let _ = sender.send_data(chunk.into()).await;
                    return;
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap()
}

/// Same framing as `stats_stream` but reads only the live collector,
/// bypassing the store entirely; 404s if the run isn't active.
async fn live_metrics_stream(id: &str, state: &AppState) -> Response<Body> {
    let run_id = id.to_string();
    let ctx = match state.run_manager.get(&run_id).await {
        Some(ctx) => ctx,
        None => return error_response(EngineError::RunNotFound(run_id)),
    };

    let (mut sender, body) = Body::channel();
    let run_manager = state.run_manager.clone();
    tokio::spawn(async move {
        loop {
            if run_manager.get(&run_id).await.is_none() {
                let payload = serde_json::json!({ "event": "complete", "runId": run_id, "status": "completed" });
                let chunk = format!("event: complete\ndata: {}\n\n", payload);
                let _ = sender.send_data(chunk.into()).await;
                return;
            }
            let (sent, _expected) = ctx.progress();
            let stats = ctx.metrics.current_stats(0, sent);
            let chunk = format!("event: metrics\ndata: {}\n\n", stats);
            if sender.send_data(chunk.into()).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap()
}

fn scripting_completions() -> Response<Body> {
    let catalog = serde_json::json!({
        "globals": ["request", "response", "environment", "globals", "collectionVars"],
        "requestFields": ["method", "url", "headers", "params", "body"],
        "responseFields": ["statusCode", "headers", "body", "latencyMs"],
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("cache-control", "public, max-age=3600")
        .body(Body::from(serde_json::to_vec(&catalog).unwrap_or_default()))
        .unwrap()
}
