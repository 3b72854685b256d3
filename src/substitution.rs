//! `{{var}}` substitution and response-side variable extraction.
//!
//! The replacement pass is generalized from the teacher's
//! `ScenarioContext::substitute_variables` (which used `${var}`/`$var`);
//! the extraction methods (JSONPath/regex/header/cookie) are generalized
//! from `extractor.rs` for use by post-scripts and post-run variable
//! capture.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::model::VariableMap;

/// Resolves `{{name}}` tokens against layered variable scopes in priority
/// order: request-local overrides, then environment, then globals.
/// Disabled variables are treated as absent.
pub fn substitute(input: &str, scopes: &[&VariableMap]) -> String {
    if !input.contains("{{") {
        return input.to_string();
    }
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match resolve(name, scopes) {
                    Some(value) => result.push_str(&value),
                    None => {
                        result.push_str("{{");
                        result.push_str(name);
                        result.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                result.push_str("{{");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

fn resolve(name: &str, scopes: &[&VariableMap]) -> Option<String> {
    for scope in scopes {
        if let Some(var) = scope.get(name) {
            if var.enabled {
                return Some(var.value.clone());
            }
        }
    }
    None
}

/// Redacts variables flagged `secret` from a message that might otherwise
/// leak their plaintext (error text, trace data, logs).
pub fn redact_secrets(mut message: String, scopes: &[&VariableMap]) -> String {
    for scope in scopes {
        for var in scope.values() {
            if var.secret && !var.value.is_empty() {
                message = message.replace(&var.value, "***");
            }
        }
    }
    message
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("JSONPath query failed: {0}")]
    JsonPath(String),
    #[error("invalid JSON response: {0}")]
    InvalidJson(String),
    #[error("regex compilation failed: {0}")]
    Regex(#[from] regex::Error),
    #[error("regex did not match")]
    RegexNoMatch,
    #[error("named capture group '{0}' not found")]
    RegexGroupNotFound(String),
    #[error("header '{0}' not found")]
    HeaderNotFound(String),
    #[error("cookie '{0}' not found")]
    CookieNotFound(String),
}

pub fn extract_json_path(body: &str, path: &str) -> Result<String, ExtractionError> {
    let json: Value = serde_json::from_str(body).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;
    let json_path = serde_json_path::JsonPath::parse(path)
        .map_err(|e| ExtractionError::JsonPath(format!("invalid JSONPath: {e}")))?;
    let nodes = json_path.query(&json);
    match nodes.exactly_one() {
        Ok(value) => Ok(match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_string(),
            other => other.to_string(),
        }),
        Err(_) => Err(ExtractionError::JsonPath(format!(
            "JSONPath '{path}' did not match exactly one value"
        ))),
    }
}

pub fn extract_regex(text: &str, pattern: &str, group: &str) -> Result<String, ExtractionError> {
    let re = Regex::new(pattern)?;
    let captures = re.captures(text).ok_or(ExtractionError::RegexNoMatch)?;
    captures
        .name(group)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ExtractionError::RegexGroupNotFound(group.to_string()))
}

pub fn extract_header(headers: &HashMap<String, String>, name: &str) -> Result<String, ExtractionError> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
        .ok_or_else(|| ExtractionError::HeaderNotFound(name.to_string()))
}

pub fn extract_cookie(set_cookie_headers: &[String], name: &str) -> Result<String, ExtractionError> {
    for header in set_cookie_headers {
        if let Some(rest) = header.strip_prefix(&format!("{name}=")) {
            let value = rest.split(';').next().unwrap_or(rest);
            return Ok(value.to_string());
        }
    }
    Err(ExtractionError::CookieNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Variable;

    fn var(value: &str) -> Variable {
        Variable { value: value.to_string(), enabled: true, secret: false }
    }

    #[test]
    fn substitutes_from_layered_scopes_in_priority_order() {
        let mut request_local = VariableMap::new();
        request_local.insert("id".to_string(), var("local-1"));
        let mut env = VariableMap::new();
        env.insert("id".to_string(), var("env-1"));
        env.insert("other".to_string(), var("env-2"));

        let result = substitute("/users/{{id}}/{{other}}", &[&request_local, &env]);
        assert_eq!(result, "/users/local-1/env-2");
    }

    #[test]
    fn leaves_unknown_tokens_untouched() {
        let scope = VariableMap::new();
        let result = substitute("/users/{{missing}}", &[&scope]);
        assert_eq!(result, "/users/{{missing}}");
    }

    #[test]
    fn disabled_variables_never_resolve() {
        let mut scope = VariableMap::new();
        scope.insert(
            "token".to_string(),
            Variable { value: "secret-val".to_string(), enabled: false, secret: false },
        );
        let result = substitute("{{token}}", &[&scope]);
        assert_eq!(result, "{{token}}");
    }

    #[test]
    fn redacts_secret_values() {
        let mut scope = VariableMap::new();
        scope.insert(
            "apiKey".to_string(),
            Variable { value: "sk-super-secret".to_string(), enabled: true, secret: true },
        );
        let redacted = redact_secrets("request failed with key sk-super-secret".to_string(), &[&scope]);
        assert!(!redacted.contains("sk-super-secret"));
        assert!(redacted.contains("***"));
    }

    #[test]
    fn json_path_extracts_scalar() {
        let body = r#"{"user":{"id":"123"}}"#;
        assert_eq!(extract_json_path(body, "$.user.id").unwrap(), "123");
    }

    #[test]
    fn regex_extracts_named_group() {
        let text = r#"<div id="user-123">"#;
        assert_eq!(extract_regex(text, r#"id="user-(?P<id>\d+)""#, "id").unwrap(), "123");
    }

    #[test]
    fn cookie_extraction_stops_at_semicolon() {
        let headers = vec!["session=abc123; Path=/; HttpOnly".to_string()];
        assert_eq!(extract_cookie(&headers, "session").unwrap(), "abc123");
    }
}
