//! End-to-end worker/event-loop tests against a real HTTP server
//! (wiremock), the same style the teacher's own `integration_test.rs` used
//! for `run_worker`.

use std::sync::Arc;
use std::time::Duration;

use loadforge_core::dns::DnsCache;
use loadforge_core::event_loop::EventLoop;
use loadforge_core::metrics::{MetricsCollector, SamplingConfig};
use loadforge_core::model::HttpMethod;
use loadforge_core::pool::{HandlePool, PoolConfig};
use loadforge_core::worker::RequestTemplate;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pool() -> Arc<HandlePool> {
    Arc::new(HandlePool::new(reqwest::Client::new(), &PoolConfig::default()))
}

fn metrics() -> Arc<MetricsCollector> {
    Arc::new(MetricsCollector::new(SamplingConfig::default()))
}

fn dns_cache() -> Arc<DnsCache> {
    Arc::new(DnsCache::new(Duration::from_secs(60)))
}

#[tokio::test]
async fn worker_completes_successful_get_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;

    let metrics = metrics();
    let event_loop = EventLoop::spawn(2, 10, pool(), None, metrics.clone(), Arc::from("run_worker_1"), dns_cache());
    let template = Arc::new(RequestTemplate {
        method: HttpMethod::Get,
        url: format!("{}/ping", server.uri()),
        host: "127.0.0.1".to_string(),
        headers: vec![],
        body: None,
        timeout: Duration::from_secs(5),
    });

    let results = event_loop.execute_batch(vec![template; 10]).await;
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| matches!(r, Some(record) if record.status_code == 200)));
    assert_eq!(metrics.total_success.load(std::sync::atomic::Ordering::Relaxed), 10);

    event_loop.stop().await;
}

#[tokio::test]
async fn worker_records_transport_failures_without_status_code() {
    let metrics = metrics();
    let event_loop = EventLoop::spawn(1, 5, pool(), None, metrics.clone(), Arc::from("run_worker_2"), dns_cache());
    let template = Arc::new(RequestTemplate {
        method: HttpMethod::Get,
        url: "http://127.0.0.1:1".to_string(),
        host: "127.0.0.1".to_string(),
        headers: vec![],
        body: None,
        timeout: Duration::from_millis(200),
    });

    let result = event_loop.submit_async(template).await.unwrap();
    assert_eq!(result.status_code, 0);
    assert!(!result.error.is_empty());
    assert_eq!(metrics.total_failed.load(std::sync::atomic::Ordering::Relaxed), 1);

    event_loop.stop().await;
}

#[tokio::test]
async fn rate_limited_event_loop_paces_submissions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let metrics = metrics();
    let event_loop = EventLoop::spawn(1, 10, pool(), Some(20.0), metrics, Arc::from("run_worker_3"), dns_cache());
    let template = Arc::new(RequestTemplate {
        method: HttpMethod::Get,
        url: format!("{}/slow", server.uri()),
        host: "127.0.0.1".to_string(),
        headers: vec![],
        body: None,
        timeout: Duration::from_secs(5),
    });

    let started = std::time::Instant::now();
    let results = event_loop.execute_batch(vec![template; 5]).await;
    assert_eq!(results.len(), 5);
    // 5 requests at 20 rps with burst 40 should not be meaningfully throttled,
    // but the limiter must still be exercised without panicking or hanging.
    assert!(started.elapsed() < Duration::from_secs(5));

    event_loop.stop().await;
}
