use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ─── Error taxonomy ──────────────────────────────────────────────────────────

/// Closed set of failure categories every backend error is mapped into.
///
/// Callers can match on the kind to decide recovery strategy without knowing
/// which backend produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, malformed, or rejected API credentials.
    InvalidCredentials,
    /// Transient request throttling; worth retrying after a delay.
    RateLimitExceeded,
    /// Billing or quota exhaustion; retrying will not help.
    QuotaExceeded,
    /// The request itself is malformed or violates backend constraints.
    ValidationError,
    /// The backend refused the content on safety grounds.
    SafetyViolation,
    /// Upstream 5xx failure.
    ServerError,
    /// Upstream temporarily unavailable (503, connection refused).
    ServiceUnavailable,
    /// The request or connection timed out.
    Timeout,
    /// The function-calling loop exceeded its round limit.
    FunctionCallingLimitExceeded,
    /// Anything we could not classify.
    UnknownProvider,
}

impl ErrorKind {
    /// Whether a retry can plausibly succeed for this kind of failure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::ServerError | Self::ServiceUnavailable | Self::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ValidationError => "validation_error",
            Self::SafetyViolation => "safety_violation",
            Self::ServerError => "server_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::FunctionCallingLimitExceeded => "function_calling_limit_exceeded",
            Self::UnknownProvider => "unknown_provider_error",
        }
    }
}

// ─── ProviderError ───────────────────────────────────────────────────────────

/// Structured failure record for a backend call.
///
/// Built once at the point of failure; the driver stamps `attempts` before
/// surfacing the error and leaves everything else untouched.
#[derive(Debug, Clone, Error)]
#[error("{provider} {}: {message}", kind.as_str())]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub provider: String,
    pub message: String,
    /// Backend-specific error code, when one was present in the body.
    pub code: Option<String>,
    /// Upstream request id for support escalation.
    pub request_id: Option<String>,
    pub retryable: bool,
    /// Server-suggested delay before the next attempt (`Retry-After`).
    pub retry_after: Option<Duration>,
    /// How many attempts were made before this error was surfaced.
    pub attempts: u32,
    /// Raw classification detail (HTTP status, backend error type, ...).
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            code: None,
            request_id: None,
            retryable: kind.is_retryable(),
            retry_after: None,
            attempts: 1,
            detail: serde_json::Map::new(),
        }
    }

    pub fn validation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, provider, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }

    /// Classify an HTTP failure from status code and (possibly empty) body.
    pub fn from_http(provider: &str, status: u16, body: &str) -> Self {
        let kind = classify_status(status, body);
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", condense(body))
        };
        let mut error = Self::new(kind, provider, message)
            .with_detail("http_status", serde_json::Value::from(status));
        if let Some(code) = extract_error_code(body) {
            error = error.with_code(code);
        }
        error
    }

    /// Classify a transport-level failure (no HTTP response).
    pub fn from_transport(provider: &str, error: &reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.is_connect() {
            ErrorKind::ServiceUnavailable
        } else {
            ErrorKind::UnknownProvider
        };
        Self::new(kind, provider, format!("request failed: {error}"))
    }
}

fn classify_status(status: u16, body: &str) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::InvalidCredentials,
        408 => ErrorKind::Timeout,
        429 => {
            if is_quota_exhausted(body) {
                ErrorKind::QuotaExceeded
            } else {
                ErrorKind::RateLimitExceeded
            }
        }
        400 | 422 => {
            if is_safety_refusal(body) {
                ErrorKind::SafetyViolation
            } else {
                ErrorKind::ValidationError
            }
        }
        402 => ErrorKind::QuotaExceeded,
        503 => ErrorKind::ServiceUnavailable,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::UnknownProvider,
    }
}

fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("exceeded your current quota")
        || lower.contains("billing")
}

fn is_safety_refusal(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("content_filter")
        || lower.contains("content_policy")
        || lower.contains("\"safety\"")
        || lower.contains("blocked")
}

/// Pull a backend error code out of a JSON error body, tolerating the shapes
/// the four backends use (`error.code`, `error.type`, top-level `status`).
fn extract_error_code(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    for key in ["code", "type", "status"] {
        if let Some(code) = error.get(key).and_then(serde_json::Value::as_str) {
            if !code.is_empty() {
                return Some(code.to_string());
            }
        }
    }
    None
}

fn condense(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= 500 {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < 500)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}…", &trimmed[..cut])
    }
}

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, ProviderError>;
