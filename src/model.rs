//! Domain entities exchanged across the control surface and persisted in the store.
//!
//! Everything here is the typed, internal representation the rest of the engine
//! traffics in. The control surface is the only place that knows about the wire's
//! camelCase casing; `serde(rename_all = "camelCase")` performs that translation
//! exactly once per type, at the boundary.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type VariableMap = HashMap<String, Variable>;

/// A single stored variable. Disabled variables never resolve; secrets are
/// elided from logs and error messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub secret: bool,
}

fn default_true() -> bool {
    true
}

/// A folder node in the request tree. Forms a forest via `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub variables: VariableMap,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    None,
    Json,
    Text,
    Form,
    Formdata,
    Binary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(rename = "type", default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub content: String,
}

/// A stored HTTP request definition belonging to a Collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDef {
    pub id: String,
    pub collection_id: String,
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub body: RequestBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_script: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variables: VariableMap,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Globals {
    pub id: String,
    #[serde(default)]
    pub variables: VariableMap,
    pub updated_at: i64,
}

impl Globals {
    pub const ID: &'static str = "globals";

    pub fn empty(now_ms: i64) -> Self {
        Self {
            id: Self::ID.to_string(),
            variables: HashMap::new(),
            updated_at: now_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Design,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    pub config_snapshot: String,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// A sampled per-request result, as written into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub run_id: String,
    pub timestamp: i64,
    pub status_code: i32,
    pub latency_ms: f64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub trace_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricName {
    Rps,
    ErrorRate,
    ConnectionsActive,
    RequestsSent,
    TotalRequests,
    LatencyAvg,
    LatencyP50,
    LatencyP75,
    LatencyP90,
    LatencyP95,
    LatencyP99,
    LatencyP999,
    SendRate,
    Throughput,
    Backpressure,
    SetupOverhead,
    TestDuration,
    StatusCodes,
    TestsPassed,
    TestsFailed,
    TestsSampled,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub run_id: String,
    pub timestamp: i64,
    pub name: MetricName,
    pub value: f64,
    #[serde(default)]
    pub labels: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigValueType {
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub value_type: ConfigValueType,
    pub label: String,
    pub description: String,
    pub category: String,
    pub default: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub updated_at: i64,
}

/// Load strategy for a `/run` request. Mirrors §6's RunSpec fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Constant,
    Iterations,
    RampUp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub duration: u64,
    pub target_rps: f64,
}

/// The POST `/run` (and, minus the strategy fields, POST `/request`) body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<RequestBody>,
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub pre_request_script: Option<String>,
    #[serde(default)]
    pub post_request_script: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub duration: Option<DurationField>,
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<u64>,
    #[serde(default)]
    pub target_rps: Option<f64>,

    #[serde(default)]
    pub start_concurrency: Option<u64>,
    #[serde(default)]
    pub ramp_up_duration: Option<DurationField>,
    #[serde(default)]
    pub stages: Option<Vec<Stage>>,

    #[serde(default)]
    pub success_sample_rate: Option<u8>,
    #[serde(default)]
    pub slow_threshold_ms: Option<f64>,
    #[serde(default)]
    pub save_timing_breakdown: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `duration` accepts either a bare integer number of seconds or a string
/// with an `s|m|h` suffix.
#[derive(Debug, Clone, Copy)]
pub struct DurationField(pub std::time::Duration);

impl<'de> Deserialize<'de> for DurationField {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }
        let raw = Raw::deserialize(deserializer)?;
        let secs = match raw {
            Raw::Int(n) => n,
            Raw::Str(s) => parse_duration_suffix(&s).map_err(serde::de::Error::custom)?,
        };
        Ok(DurationField(std::time::Duration::from_secs(secs)))
    }
}

/// Parses `"Ns"`, `"Nm"`, `"Nh"`, or a bare digit string, into seconds.
pub fn parse_duration_suffix(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (value, unit) = s.split_at(s.len() - 1);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid numeric value in duration: '{}'", value))?;
    match unit {
        "s" => Ok(value),
        "m" => Ok(value * 60),
        "h" => Ok(value * 60 * 60),
        _ => Err(format!("unknown duration unit: '{}'; use s, m, or h", unit)),
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generates an opaque id: `<prefix>_<ms>_<rand6>`.
pub fn generate_id(prefix: &str) -> String {
    use rand::Rng;
    let ms = now_ms();
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{prefix}_{ms}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_suffix_parses_seconds_minutes_hours() {
        assert_eq!(parse_duration_suffix("5s").unwrap(), 5);
        assert_eq!(parse_duration_suffix("2m").unwrap(), 120);
        assert_eq!(parse_duration_suffix("1h").unwrap(), 3600);
        assert_eq!(parse_duration_suffix("42").unwrap(), 42);
    }

    #[test]
    fn duration_suffix_rejects_garbage() {
        assert!(parse_duration_suffix("").is_err());
        assert!(parse_duration_suffix("nope").is_err());
        assert!(parse_duration_suffix("5x").is_err());
    }

    #[test]
    fn generated_ids_carry_prefix_and_are_unique() {
        let a = generate_id("run");
        let b = generate_id("run");
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
    }

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn globals_singleton_id_is_fixed() {
        let g = Globals::empty(0);
        assert_eq!(g.id, "globals");
    }
}
