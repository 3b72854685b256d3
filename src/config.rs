//! Process-wide tunable registry backing the `/config` routes.
//!
//! Bootstraps from environment variables using the teacher's own
//! `env_parse_or` helper, but the closed tunable set itself and the
//! `ConfigEntry` shape (typed value, label, description,
//! category, min/max) come from spec.md §6's configuration table rather than
//! the teacher's free-form `Config` struct — every other teacher knob
//! (load model selection, mTLS paths, custom headers) has no counterpart
//! here and is dropped.

use std::collections::HashMap;
use std::env;
use std::sync::RwLock;

use thiserror::Error;

use crate::model::{now_ms, ConfigEntry, ConfigValueType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("value for {key} must be between {min} and {max}")]
    OutOfRange { key: String, min: f64, max: f64 },
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// One closed-set tunable's bootstrap shape: env var name, dotted key,
/// default, type, and the human-facing fields `ConfigEntry` carries.
struct Tunable {
    env_var: &'static str,
    key: &'static str,
    label: &'static str,
    description: &'static str,
    category: &'static str,
    default: f64,
    value_type: ConfigValueType,
    min: Option<f64>,
    max: Option<f64>,
}

const TUNABLES: &[Tunable] = &[
    Tunable { env_var: "LOADFORGE_SERVER_PORT", key: "server.port", label: "Server Port", description: "TCP port the control surface binds to", category: "server", default: 9876.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: Some(65535.0) },
    Tunable { env_var: "LOADFORGE_WORKERS", key: "workers", label: "Workers", description: "Worker task count per run; 0 selects available parallelism", category: "execution", default: 0.0, value_type: ConfigValueType::Integer, min: Some(0.0), max: None },
    Tunable { env_var: "LOADFORGE_MAX_CONCURRENT", key: "max_concurrent", label: "Max Concurrent", description: "Global in-flight request cap per run", category: "execution", default: 1000.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_MAX_PER_HOST", key: "max_per_host", label: "Max Per Host", description: "In-flight request cap per destination host", category: "execution", default: 100.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_POLL_TIMEOUT_MS", key: "poll_timeout_ms", label: "Poll Timeout (ms)", description: "Reactor poll timeout", category: "execution", default: 10.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_DNS_CACHE_TTL_S", key: "dns_cache_ttl_s", label: "DNS Cache TTL (s)", description: "Freshness window for cached DNS answers", category: "networking", default: 300.0, value_type: ConfigValueType::Integer, min: Some(0.0), max: None },
    Tunable { env_var: "LOADFORGE_SCRIPT_TIMEOUT_MS", key: "script_timeout_ms", label: "Script Timeout (ms)", description: "Wall-clock budget for one pre/post-script invocation", category: "scripting", default: 5000.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_SCRIPT_MEMORY_BYTES", key: "script_memory_bytes", label: "Script Memory (bytes)", description: "Heap budget for one script invocation", category: "scripting", default: 67_108_864.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_SCRIPT_STACK_BYTES", key: "script_stack_bytes", label: "Script Stack (bytes)", description: "Stack budget for one script invocation", category: "scripting", default: 262_144.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_DEFAULT_TIMEOUT_MS", key: "default_timeout_ms", label: "Default Request Timeout (ms)", description: "Per-request timeout when a RunSpec omits one", category: "execution", default: 30_000.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_STATS_INTERVAL_MS", key: "stats_interval_ms", label: "Stats Interval (ms)", description: "Cadence of the run controller's metrics thread", category: "observability", default: 1000.0, value_type: ConfigValueType::Integer, min: Some(1.0), max: None },
    Tunable { env_var: "LOADFORGE_GRACEFUL_STOP_MS", key: "graceful_stop_ms", label: "Graceful Stop (ms)", description: "Upper bound a stop waits for in-flight completions", category: "execution", default: 5000.0, value_type: ConfigValueType::Integer, min: Some(0.0), max: None },
    Tunable { env_var: "LOADFORGE_TARGET_RPS", key: "target_rps", label: "Default Target RPS", description: "Aggregate rate applied when a RunSpec omits targetRps", category: "execution", default: 0.0, value_type: ConfigValueType::Number, min: Some(0.0), max: None },
    Tunable { env_var: "LOADFORGE_BURST_SIZE", key: "burst_size", label: "Burst Size", description: "Token bucket burst capacity; defaults to twice the target rate", category: "execution", default: 0.0, value_type: ConfigValueType::Number, min: Some(0.0), max: None },
];

/// Process-wide tunable store. Not a `lazy_static` — owned by `AppState`
/// and constructed once in `main.rs`.
pub struct ConfigRegistry {
    entries: RwLock<HashMap<String, ConfigEntry>>,
}

impl ConfigRegistry {
    /// Loads every tunable from its environment variable, falling back to
    /// the table's default. Fails closed on the first unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut entries = HashMap::new();
        let now = now_ms();
        for tunable in TUNABLES {
            let value: f64 = env_parse_or(tunable.env_var, tunable.default)?;
            if let (Some(min), Some(max)) = (tunable.min, tunable.max) {
                if value < min || value > max {
                    return Err(ConfigError::OutOfRange { key: tunable.key.to_string(), min, max });
                }
            }
            entries.insert(
                tunable.key.to_string(),
                ConfigEntry {
                    key: tunable.key.to_string(),
                    value: json_for(tunable.value_type, value),
                    value_type: tunable.value_type,
                    label: tunable.label.to_string(),
                    description: tunable.description.to_string(),
                    category: tunable.category.to_string(),
                    default: json_for(tunable.value_type, tunable.default),
                    min: tunable.min,
                    max: tunable.max,
                    updated_at: now,
                },
            );
        }
        Ok(Self { entries: RwLock::new(entries) })
    }

    pub fn list(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<_> = self.entries.read().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn get(&self, key: &str) -> Option<ConfigEntry> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Updates a tunable's value in place. Rejects unknown keys and values
    /// outside the entry's declared `[min, max]`.
    pub fn set(&self, key: &str, value: f64) -> Result<ConfigEntry, ConfigError> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(key).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        if let (Some(min), Some(max)) = (entry.min, entry.max) {
            if value < min || value > max {
                return Err(ConfigError::OutOfRange { key: key.to_string(), min, max });
            }
        }
        entry.value = json_for(entry.value_type, value);
        entry.updated_at = now_ms();
        Ok(entry.clone())
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key).and_then(|e| e.value.as_f64()).map(|v| v as u64).unwrap_or(0)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.get(key).and_then(|e| e.value.as_f64()).unwrap_or(0.0)
    }
}

fn json_for(value_type: ConfigValueType, value: f64) -> serde_json::Value {
    match value_type {
        ConfigValueType::Integer => serde_json::json!(value as i64),
        ConfigValueType::Boolean => serde_json::json!(value != 0.0),
        ConfigValueType::Number | ConfigValueType::String => serde_json::json!(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for tunable in TUNABLES {
            env::remove_var(tunable.env_var);
        }
    }

    #[test]
    fn defaults_load_when_env_is_unset() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let registry = ConfigRegistry::from_env().unwrap();
        assert_eq!(registry.get_u64("server.port"), 9876);
        assert_eq!(registry.get_u64("max_concurrent"), 1000);
    }

    #[test]
    fn env_override_takes_precedence() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("LOADFORGE_SERVER_PORT", "9000");
        let registry = ConfigRegistry::from_env().unwrap();
        assert_eq!(registry.get_u64("server.port"), 9000);
        env::remove_var("LOADFORGE_SERVER_PORT");
    }

    #[test]
    fn set_rejects_unknown_key() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let registry = ConfigRegistry::from_env().unwrap();
        assert!(matches!(registry.set("not_a_key", 1.0), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn set_rejects_out_of_range_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let registry = ConfigRegistry::from_env().unwrap();
        assert!(matches!(registry.set("server.port", 70_000.0), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn set_updates_value_and_timestamp() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let registry = ConfigRegistry::from_env().unwrap();
        let updated = registry.set("workers", 4.0).unwrap();
        assert_eq!(updated.value, serde_json::json!(4));
        assert_eq!(registry.get_u64("workers"), 4);
    }
}
