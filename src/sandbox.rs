//! The script sandbox capability consumed for pre/post-request hooks.
//!
//! The actual JavaScript runtime is explicitly out of scope (spec §1); this
//! module defines the seam a future embedder fills in, plus a `NullSandbox`
//! so "no script configured" never needs a separate code path in
//! Design-mode or Load-mode execution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::model::VariableMap;

/// Mutable execution context handed to a script invocation. `request` and
/// `response` are serialized snapshots; `environment`/`globals`/
/// `collection_vars` are the variable scopes a script may read or write.
pub struct ScriptContext {
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub environment: VariableMap,
    pub globals: VariableMap,
    pub collection_vars: VariableMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tests: Vec<TestOutcome>,
    pub console: Vec<String>,
}

impl ScriptResult {
    pub fn empty_success() -> Self {
        Self {
            success: true,
            error: None,
            tests: Vec::new(),
            console: Vec::new(),
        }
    }
}

pub type SandboxFuture<'a> = Pin<Box<dyn Future<Output = ScriptResult> + Send + 'a>>;

/// A pre/post-script execution capability. Limits (memory, wall-clock,
/// stack) are the implementation's responsibility; the engine only ever
/// observes a `ScriptResult` and treats any failure as recoverable.
pub trait ScriptSandbox: Send + Sync {
    fn run<'a>(&'a self, script: &'a str, ctx: &'a mut ScriptContext) -> SandboxFuture<'a>;
}

/// Used whenever a request defines no pre/post script.
pub struct NullSandbox;

impl ScriptSandbox for NullSandbox {
    fn run<'a>(&'a self, _script: &'a str, _ctx: &'a mut ScriptContext) -> SandboxFuture<'a> {
        Box::pin(async { ScriptResult::empty_success() })
    }
}

/// Applies variable writes made via a Design-Mode script invocation back
/// into the owning scopes. Load-Mode invocations must never call this —
/// their writes are sampled and discarded per spec §4.F.
pub fn persist_design_mode_writes(
    ctx: &ScriptContext,
    environment: &mut VariableMap,
    globals: &mut VariableMap,
) {
    for (k, v) in &ctx.environment {
        environment.insert(k.clone(), v.clone());
    }
    for (k, v) in &ctx.globals {
        globals.insert(k.clone(), v.clone());
    }
}

/// Builds the response-phase `ctx.response` snapshot from a raw status,
/// headers, and body.
pub fn response_snapshot(status: u16, headers: &HashMap<String, String>, body: &str) -> serde_json::Value {
    serde_json::json!({
        "status": status,
        "headers": headers,
        "body": body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sandbox_always_succeeds() {
        let sandbox = NullSandbox;
        let mut ctx = ScriptContext {
            request: serde_json::json!({}),
            response: None,
            environment: VariableMap::new(),
            globals: VariableMap::new(),
            collection_vars: VariableMap::new(),
        };
        let result = sandbox.run("ignored", &mut ctx).await;
        assert!(result.success);
        assert!(result.tests.is_empty());
    }

    #[test]
    fn design_mode_writes_flow_into_owning_scopes() {
        let mut ctx = ScriptContext {
            request: serde_json::json!({}),
            response: None,
            environment: VariableMap::new(),
            globals: VariableMap::new(),
            collection_vars: VariableMap::new(),
        };
        ctx.environment.insert(
            "token".to_string(),
            crate::model::Variable {
                value: "abc".to_string(),
                enabled: true,
                secret: false,
            },
        );
        let mut env = VariableMap::new();
        let mut globals = VariableMap::new();
        persist_design_mode_writes(&ctx, &mut env, &mut globals);
        assert_eq!(env.get("token").unwrap().value, "abc");
    }
}
