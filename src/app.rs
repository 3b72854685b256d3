//! Process-wide shared state, constructed once in `main.rs`.
//!
//! The teacher's `metrics.rs`/`main.rs` kept its Prometheus registry and
//! percentile trackers behind `lazy_static!`; spec.md's anti-singleton
//! design note asks for the opposite, so every long-lived collaborator is
//! an owned field here, built once and handed out as `Arc<AppState>` to
//! every route handler.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, ConfigRegistry};
use crate::dns::DnsCache;
use crate::error::EngineError;
use crate::pool::{HandlePool, PoolConfig};
use crate::run_manager::RunManager;
use crate::sandbox::{NullSandbox, ScriptSandbox};
use crate::store::Store;

pub struct AppState {
    pub config: ConfigRegistry,
    pub store: Arc<Store>,
    pub run_manager: Arc<RunManager>,
    pub dns_cache: Arc<DnsCache>,
    pub pool: Arc<HandlePool>,
    pub sandbox: Arc<dyn ScriptSandbox>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AppState {
    /// Loads the tunable registry from the environment, opens the store at
    /// `db_path` (or an in-memory database when empty, for tests), and
    /// builds the DNS cache and handle pool from the loaded tunables.
    pub async fn build(db_path: &str) -> Result<Self, AppError> {
        let config = ConfigRegistry::from_env()?;

        let store = if db_path.is_empty() {
            Store::open_in_memory().await?
        } else {
            Store::open(db_path).await?
        };

        let pool_config = PoolConfig {
            max_concurrent: config.get_u64("max_concurrent") as usize,
            max_per_host: config.get_u64("max_per_host") as usize,
            ..PoolConfig::default()
        };
        let client = pool_config
            .apply_to_builder(reqwest::Client::builder())
            .build()
            .expect("reqwest client builder never fails with default TLS backend");
        let pool = Arc::new(HandlePool::new(client, &pool_config));

        let dns_ttl = Duration::from_secs(config.get_u64("dns_cache_ttl_s"));

        Ok(Self {
            config,
            store: Arc::new(store),
            run_manager: Arc::new(RunManager::new()),
            dns_cache: Arc::new(DnsCache::new(dns_ttl)),
            pool,
            sandbox: Arc::new(NullSandbox),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrent: self.config.get_u64("max_concurrent") as usize,
            max_per_host: self.config.get_u64("max_per_host") as usize,
            ..PoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_wires_defaults_from_config() {
        std::env::remove_var("LOADFORGE_MAX_CONCURRENT");
        let app = AppState::build("").await.unwrap();
        assert_eq!(app.config.get_u64("max_concurrent"), 1000);
        assert!(app.run_manager.active_run_ids().await.is_empty());
    }
}
