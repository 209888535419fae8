use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use serde_json::{json, Value};

/// Classification of a single failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Retryable: upstream overloaded, rate limited, timed out or dropped the connection.
    Transient,
    /// Credential is stale; one refresh attempt is allowed.
    AuthExpired,
    /// The request is too large for the upstream context window.
    ContextTooLarge,
    /// Everything else.
    Fatal,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::AuthExpired => "auth_expired",
            FailureKind::ContextTooLarge => "context_too_large",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified upstream failure together with the diagnostics the upstream gave us.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} upstream failure (status={status:?}): {message}")]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub error_type: Option<String>,
    pub request_id: Option<String>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl UpstreamFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            error_type: None,
            request_id: None,
            retry_after: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    /// Classify an HTTP-level rejection.
    #[must_use]
    pub fn from_status(status: u16, error_type: Option<String>, body: &str) -> Self {
        let kind = classify_status(status, error_type.as_deref(), body);
        Self {
            kind,
            status: Some(status),
            error_type,
            request_id: None,
            retry_after: None,
            message: summarize_body(body),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    #[must_use]
    pub fn with_error_type(mut self, error_type: Option<String>) -> Self {
        self.error_type = error_type;
        self
    }
}

static CONTEXT_OVERFLOW_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(context[_ ]length|context window|too many tokens|input is too long|prompt is too long|content_length_exceeds_threshold|maximum context|exceeds? the (maximum|limit))",
    )
    .ok()
});

static STALE_TOKEN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(token (is )?(expired|invalid)|expired token|invalid bearer|security token)")
        .ok()
});

fn regex_hit(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// Map an upstream status (plus error-type header and body) to a failure kind.
#[must_use]
pub fn classify_status(status: u16, error_type: Option<&str>, body: &str) -> FailureKind {
    match status {
        401 => FailureKind::AuthExpired,
        403 if regex_hit(&STALE_TOKEN_RE, body) => FailureKind::AuthExpired,
        400 | 413 | 422 if looks_like_context_overflow(error_type, body) => {
            FailureKind::ContextTooLarge
        }
        408 | 429 | 500..=599 => FailureKind::Transient,
        _ => FailureKind::Fatal,
    }
}

/// Classify an in-band error code reported inside an otherwise healthy stream.
#[must_use]
pub fn classify_error_code(code: &str, message: &str) -> FailureKind {
    let code = code.to_ascii_lowercase();
    if code.contains("rate_limit") || code.contains("overloaded") || code.contains("server_error")
    {
        FailureKind::Transient
    } else if code.contains("context_length") || looks_like_context_overflow(None, message) {
        FailureKind::ContextTooLarge
    } else if code.contains("invalid_api_key") || code.contains("expired") {
        FailureKind::AuthExpired
    } else {
        FailureKind::Fatal
    }
}

fn looks_like_context_overflow(error_type: Option<&str>, body: &str) -> bool {
    regex_hit(&CONTEXT_OVERFLOW_RE, body)
        || error_type.is_some_and(|ty| regex_hit(&CONTEXT_OVERFLOW_RE, ty))
}

fn summarize_body(body: &str) -> String {
    const MAX_MESSAGE_CHARS: usize = 512;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty upstream error body".to_string();
    }
    crate::util::truncate_chars(trimmed, MAX_MESSAGE_CHARS).to_string()
}

/// Caller-facing error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("No backend configured for model '{0}'")]
    NoRoute(String),
    #[error("No active credential available for backend '{0}'")]
    NoCredential(String),
    #[error("Upstream error: {0}")]
    Upstream(UpstreamFailure),
    #[error("Upstream still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: UpstreamFailure },
    #[error("Credential refresh failed: {message}")]
    AuthRefresh {
        message: String,
        last: Option<UpstreamFailure>,
    },
    #[error("Context limit reached after {levels} compression levels; start a new conversation")]
    ContextLimit { levels: usize, last: UpstreamFailure },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    ContextLimit,
    RateLimit,
    Unavailable,
    ServerError,
}

impl GatewayError {
    /// The failure that caused this error, when one came from the upstream.
    #[must_use]
    pub fn upstream_failure(&self) -> Option<&UpstreamFailure> {
        match self {
            GatewayError::Upstream(last)
            | GatewayError::RetriesExhausted { last, .. }
            | GatewayError::ContextLimit { last, .. } => Some(last),
            GatewayError::AuthRefresh { last, .. } => last.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::NoRoute(_) => {
                ErrorCategory::InvalidRequest
            }
            GatewayError::AuthRefresh { .. } => ErrorCategory::Authentication,
            GatewayError::ContextLimit { .. } => ErrorCategory::ContextLimit,
            GatewayError::NoCredential(_) => ErrorCategory::Unavailable,
            GatewayError::RetriesExhausted { last, .. } => match last.status {
                Some(429) => ErrorCategory::RateLimit,
                _ => ErrorCategory::Unavailable,
            },
            GatewayError::Upstream(failure) => match failure.kind {
                FailureKind::AuthExpired => ErrorCategory::Authentication,
                FailureKind::ContextTooLarge => ErrorCategory::ContextLimit,
                FailureKind::Transient => ErrorCategory::Unavailable,
                FailureKind::Fatal => match failure.status {
                    Some(400..=499) => ErrorCategory::InvalidRequest,
                    _ => ErrorCategory::ServerError,
                },
            },
            GatewayError::Config(_) | GatewayError::Transport(_) | GatewayError::Internal(_) => {
                ErrorCategory::ServerError
            }
        }
    }

    /// Stable machine-readable error type.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self.category() {
            ErrorCategory::InvalidRequest => "invalid_request_error",
            ErrorCategory::Authentication => "authentication_error",
            ErrorCategory::ContextLimit => "context_limit_error",
            ErrorCategory::RateLimit => "rate_limit_error",
            ErrorCategory::Unavailable => "overloaded_error",
            ErrorCategory::ServerError => "api_error",
        }
    }

    /// The single structured error object surfaced to callers.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let failure = self.upstream_failure();
        json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "classification": failure.map(|f| f.kind.as_str()),
                "status": failure.and_then(|f| f.status),
                "upstream_error_type": failure.and_then(|f| f.error_type.clone()),
                "upstream_request_id": failure.and_then(|f| f.request_id.clone()),
            }
        })
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest | ErrorCategory::ContextLimit => {
            http::StatusCode::BAD_REQUEST
        }
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::Unavailable => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError => http::StatusCode::BAD_GATEWAY,
    }
}

/// Format an error as (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, Value) {
    (http_status_for_category(err.category()), err.to_payload())
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_table() {
        assert_eq!(classify_status(401, None, ""), FailureKind::AuthExpired);
        assert_eq!(classify_status(429, None, ""), FailureKind::Transient);
        assert_eq!(classify_status(503, None, ""), FailureKind::Transient);
        assert_eq!(classify_status(404, None, "nope"), FailureKind::Fatal);
        assert_eq!(
            classify_status(400, None, "{\"message\":\"bad field\"}"),
            FailureKind::Fatal
        );
    }

    #[test]
    fn test_validation_400_is_context_too_large() {
        let body = r#"{"message":"Input is too long for requested model.","reason":"CONTENT_LENGTH_EXCEEDS_THRESHOLD"}"#;
        assert_eq!(
            classify_status(400, Some("ValidationException"), body),
            FailureKind::ContextTooLarge
        );
        assert_eq!(
            classify_status(400, None, "This model's maximum context length is 128000 tokens"),
            FailureKind::ContextTooLarge
        );
    }

    #[test]
    fn test_forbidden_with_expired_token_is_auth_expired() {
        assert_eq!(
            classify_status(403, None, "The bearer token included in the request is invalid: token expired"),
            FailureKind::AuthExpired
        );
        assert_eq!(classify_status(403, None, "access denied"), FailureKind::Fatal);
    }

    #[test]
    fn test_classify_error_code() {
        assert_eq!(
            classify_error_code("rate_limit_exceeded", ""),
            FailureKind::Transient
        );
        assert_eq!(
            classify_error_code("context_length_exceeded", ""),
            FailureKind::ContextTooLarge
        );
        assert_eq!(classify_error_code("invalid_prompt", "nope"), FailureKind::Fatal);
    }

    #[test]
    fn test_payload_carries_upstream_diagnostics() {
        let failure = UpstreamFailure::from_status(500, Some("InternalFailure".into()), "boom")
            .with_request_id(Some("req-123".into()));
        let err = GatewayError::RetriesExhausted {
            attempts: 3,
            last: failure,
        };
        let payload = err.to_payload();
        assert_eq!(payload["error"]["classification"], "transient");
        assert_eq!(payload["error"]["status"], 500);
        assert_eq!(payload["error"]["upstream_error_type"], "InternalFailure");
        assert_eq!(payload["error"]["upstream_request_id"], "req-123");
        assert_eq!(format_error(&err).0, http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_context_limit_is_distinct() {
        let err = GatewayError::ContextLimit {
            levels: 4,
            last: UpstreamFailure::new(FailureKind::ContextTooLarge, "too long"),
        };
        assert_eq!(err.category(), ErrorCategory::ContextLimit);
        assert_eq!(err.error_type(), "context_limit_error");
    }
}
