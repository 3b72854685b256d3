//! Closed error taxonomy shared by the execution core and the control surface.
//!
//! `ErrorCategory` classifies client-side transport failures the way the
//! teacher's error module did; `EngineError` wraps it into the symbols the
//! control surface's error envelope (spec §6/§7) actually emits.

use thiserror::Error;

/// Client-side transport failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Timeout,
    DnsError,
    ConnectionFailed,
    TlsError,
    Cancelled,
    Other,
}

impl ErrorCategory {
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return ErrorCategory::Timeout;
        }
        if error.is_connect() {
            return ErrorCategory::ConnectionFailed;
        }
        let msg = error.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            ErrorCategory::TlsError
        } else if msg.contains("dns") || msg.contains("resolve") {
            ErrorCategory::DnsError
        } else if msg.contains("connect") || msg.contains("connection") {
            ErrorCategory::ConnectionFailed
        } else if msg.contains("timeout") {
            ErrorCategory::Timeout
        } else {
            ErrorCategory::Other
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::DnsError => "DnsError",
            ErrorCategory::ConnectionFailed => "ConnectionFailed",
            ErrorCategory::TlsError => "TlsError",
            ErrorCategory::Cancelled => "Cancelled",
            ErrorCategory::Other => "Other",
        }
    }
}

/// Engine-wide error, one variant per error-envelope code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("script error: {0}")]
    ScriptError(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("dns resolution failed: {0}")]
    DnsError(String),
    #[error("tls error: {0}")]
    SslError(String),
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The symbol used in the `{"error":{"code":...}}` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "INVALID_REQUEST",
            EngineError::InvalidJson(_) => "INVALID_JSON",
            EngineError::InvalidUrl(_) => "INVALID_URL",
            EngineError::InvalidMethod(_) => "INVALID_METHOD",
            EngineError::ScriptError(_) => "SCRIPT_ERROR",
            EngineError::RunNotFound(_) => "RUN_NOT_FOUND",
            EngineError::Timeout => "TIMEOUT",
            EngineError::ConnectionFailed(_) => "CONNECTION_FAILED",
            EngineError::DnsError(_) => "DNS_ERROR",
            EngineError::SslError(_) => "SSL_ERROR",
            EngineError::DatabaseError(_) => "DATABASE_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            EngineError::InvalidRequest(_)
            | EngineError::InvalidJson(_)
            | EngineError::InvalidUrl(_)
            | EngineError::InvalidMethod(_)
            | EngineError::ScriptError(_) => 400,
            EngineError::RunNotFound(_) => 404,
            EngineError::Timeout | EngineError::ConnectionFailed(_) | EngineError::DnsError(_)
            | EngineError::SslError(_) => 502,
            EngineError::DatabaseError(_) | EngineError::Internal(_) => 500,
        }
    }

    /// Maps a transport failure observed while sending a request into the
    /// client-side-transport variant the store records as `Result.error`.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        match ErrorCategory::from_reqwest_error(err) {
            ErrorCategory::Timeout => EngineError::Timeout,
            ErrorCategory::DnsError => EngineError::DnsError(err.to_string()),
            ErrorCategory::ConnectionFailed => EngineError::ConnectionFailed(err.to_string()),
            ErrorCategory::TlsError => EngineError::SslError(err.to_string()),
            ErrorCategory::Cancelled | ErrorCategory::Other => {
                EngineError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_error_envelope_symbols() {
        assert_eq!(EngineError::InvalidRequest("x".into()).code(), "INVALID_REQUEST");
        assert_eq!(EngineError::RunNotFound("r1".into()).code(), "RUN_NOT_FOUND");
        assert_eq!(EngineError::Timeout.code(), "TIMEOUT");
    }

    #[test]
    fn statuses_match_spec_table() {
        assert_eq!(EngineError::InvalidRequest("x".into()).status(), 400);
        assert_eq!(EngineError::RunNotFound("x".into()).status(), 404);
        assert_eq!(EngineError::Timeout.status(), 502);
        assert_eq!(EngineError::DatabaseError("x".into()).status(), 500);
    }
}
