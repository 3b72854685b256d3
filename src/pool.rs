//! Reusable outbound HTTP handle pool.
//!
//! reqwest already owns the real TCP/TLS/H2 connection pool; this module's
//! `PoolConfig` applies the same knobs the teacher's `connection_pool.rs`
//! exposed to a `reqwest::ClientBuilder`, and layers a counting semaphore on
//! top for the `acquire`/`release`/`release_bad` contract spec §4.B
//! describes (per-worker `max_concurrent`, per-origin `max_per_host`).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
    pub tcp_keepalive_interval: Option<Duration>,
    pub max_concurrent: usize,
    pub max_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
            tcp_keepalive_interval: Some(Duration::from_secs(30)),
            max_concurrent: 1000,
            max_per_host: 100,
        }
    }
}

impl PoolConfig {
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);
        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }
        if let Some(interval) = self.tcp_keepalive_interval {
            builder = builder.tcp_keepalive_interval(interval);
        }
        builder
    }
}

/// A leased handle. Dropping it without calling `release`/`release_bad`
/// still frees the concurrency slots (the permits are held by the guard),
/// but the caller should explicitly classify the outcome so the host slot
/// is accounted for.
pub struct Handle {
    client: reqwest::Client,
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

impl Handle {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

struct HostLimiter {
    semaphore: Arc<Semaphore>,
}

/// Acquire/release pool over a shared `reqwest::Client`. One `HandlePool`
/// is owned per worker, matching the spec's "no cross-worker sharing
/// needed" shared-resource policy.
pub struct HandlePool {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    max_per_host: usize,
    hosts: std::sync::Mutex<std::collections::HashMap<String, Arc<HostLimiter>>>,
}

impl HandlePool {
    pub fn new(client: reqwest::Client, config: &PoolConfig) -> Self {
        Self {
            client,
            global: Arc::new(Semaphore::new(config.max_concurrent)),
            max_per_host: config.max_per_host,
            hosts: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn host_limiter(&self, host: &str) -> Arc<HostLimiter> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostLimiter {
                    semaphore: Arc::new(Semaphore::new(self.max_per_host)),
                })
            })
            .clone()
    }

    /// Acquires a handle for `host`, blocking until both the worker-wide
    /// and per-host concurrency budgets have a free slot.
    pub async fn acquire(&self, host: &str) -> Handle {
        let global_permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore never closed");
        let limiter = self.host_limiter(host);
        let host_permit = limiter
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("host semaphore never closed");
        Handle {
            client: self.client.clone(),
            _global: global_permit,
            _host: host_permit,
        }
    }

    /// Returns a handle to the pool after a clean completion. Releasing is
    /// implicit (permits drop with the handle); this exists for symmetry
    /// with `release_bad` and to make call sites read like the contract.
    pub fn release(&self, _handle: Handle) {}

    /// Discards a handle after a connection error or protocol fault.
    pub fn release_bad(&self, _handle: Handle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_respects_global_cap() {
        let config = PoolConfig {
            max_concurrent: 1,
            max_per_host: 10,
            ..Default::default()
        };
        let pool = HandlePool::new(reqwest::Client::new(), &config);
        let h1 = pool.acquire("example.com").await;
        assert_eq!(pool.global.available_permits(), 0);
        pool.release(h1);
        assert_eq!(pool.global.available_permits(), 1);
    }

    #[tokio::test]
    async fn per_host_limiters_are_independent() {
        let config = PoolConfig {
            max_concurrent: 10,
            max_per_host: 1,
            ..Default::default()
        };
        let pool = HandlePool::new(reqwest::Client::new(), &config);
        let a = pool.acquire("a.example.com").await;
        let b = pool.acquire("b.example.com").await;
        pool.release(a);
        pool.release(b);
    }
}
