//! Host-to-IP resolution cache with TTL expiry and a soft-capped LRU eviction.
//!
//! Mirrors the eviction discipline `percentiles::MultiLabelPercentileTracker`
//! already applies to unbounded label sets, but keyed by hostname and with a
//! time-based freshness check layered on top.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

const DEFAULT_SOFT_CAP: usize = 1024;

#[derive(Clone)]
struct DnsEntry {
    addrs: Vec<SocketAddr>,
    expires_at: Instant,
}

pub struct DnsCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, DnsEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_SOFT_CAP)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(DEFAULT_SOFT_CAP).unwrap());
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns a fresh set of addresses for `host:port`, resolving and
    /// caching on a miss or expiry.
    pub async fn resolve(&self, host_port: &str) -> std::io::Result<Vec<SocketAddr>> {
        if let Some(addrs) = self.fresh_hit(host_port) {
            return Ok(addrs);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(host_port).await?.collect();
        let mut entries = self.entries.lock().unwrap();
        entries.put(
            host_port.to_string(),
            DnsEntry {
                addrs: addrs.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(addrs)
    }

    fn fresh_hit(&self, host_port: &str) -> Option<Vec<SocketAddr>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(host_port) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.addrs.clone()),
            _ => None,
        }
    }

    /// Invalidates an entry after the caller observes a connection failure
    /// against it, so the next resolve attempt re-queries.
    pub fn invalidate(&self, host_port: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.pop(host_port).is_some() {
            debug!(host = host_port, "invalidated dns cache entry");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_and_caches_localhost() {
        let cache = DnsCache::new(Duration::from_secs(300));
        let addrs = cache.resolve("localhost:9876").await.unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = DnsCache::new(Duration::from_secs(300));
        cache.resolve("localhost:9876").await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.invalidate("localhost:9876");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn soft_cap_evicts_oldest() {
        let cache = DnsCache::with_capacity(Duration::from_secs(300), 2);
        {
            let mut entries = cache.entries.lock().unwrap();
            entries.put(
                "a:1".into(),
                DnsEntry { addrs: vec![], expires_at: Instant::now() + Duration::from_secs(60) },
            );
            entries.put(
                "b:1".into(),
                DnsEntry { addrs: vec![], expires_at: Instant::now() + Duration::from_secs(60) },
            );
            entries.put(
                "c:1".into(),
                DnsEntry { addrs: vec![], expires_at: Instant::now() + Duration::from_secs(60) },
            );
        }
        assert_eq!(cache.len(), 2);
    }
}
