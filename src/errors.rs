//! The closed error-kind taxonomy (spec.md §7) and the structured,
//! user-visible error info every task failure carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    HttpError,
    /// A non-2xx HTTP response outside the retryable 408/429/5xx set (spec.md
    /// §7: "HttpError ... yes for 408, 429, 5xx" implies the remaining 4xx
    /// responses, e.g. 400/404/422, are not retryable). Kept distinct from
    /// `HttpError` so `retryable()` stays a pure function of kind.
    HttpClientError,
    NetworkError,
    AuthenticationError,
    RateLimitError,
    ValidationError,
    ConfigurationError,
    CircuitOpen,
    TemplateResolution,
    CircularDependency,
    WorkflowCycle,
    DepthExceeded,
    Cancelled,
    UnknownError,
}

impl ErrorKind {
    /// Table in spec.md §7: which kinds trigger the retry policy.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::HttpError
                | ErrorKind::NetworkError
                | ErrorKind::RateLimitError
        )
    }

    /// HTTP status classification from spec.md §4.4/§7.
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::AuthenticationError,
            429 => ErrorKind::RateLimitError,
            408 | 500..=599 => ErrorKind::HttpError,
            400..=499 => ErrorKind::HttpClientError,
            _ => ErrorKind::HttpError,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: String,
    pub retry_attempts: u32,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub service_host: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub duration_until_error_ms: i64,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let occurred_at = Utc::now();
        let duration_until_error_ms = (occurred_at - started_at).num_milliseconds();
        Self {
            kind,
            message: message.into(),
            suggestion: suggestion_for(kind),
            retry_attempts: 0,
            http_status: None,
            service_host: None,
            occurred_at,
            duration_until_error_ms,
        }
    }

    #[must_use]
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_service_host(mut self, host: impl Into<String>) -> Self {
        self.service_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }
}

fn suggestion_for(kind: ErrorKind) -> String {
    match kind {
        ErrorKind::Timeout => "increase the task timeout or investigate slow upstream latency".into(),
        ErrorKind::HttpError => "check the target service's health and response status".into(),
        ErrorKind::HttpClientError => "fix the request: the target rejected it as a client error (4xx)".into(),
        ErrorKind::NetworkError => "verify connectivity and DNS resolution to the target host".into(),
        ErrorKind::AuthenticationError => "verify credentials or tokens used for this call".into(),
        ErrorKind::RateLimitError => "reduce call frequency or configure a retry backoff".into(),
        ErrorKind::ValidationError => "check the task input/output against its schema".into(),
        ErrorKind::ConfigurationError => "fix the task spec: missing URL, bad method, or unparsable template".into(),
        ErrorKind::CircuitOpen => "configure a fallback task or wait for the breaker to reset".into(),
        ErrorKind::TemplateResolution => "verify the referenced field or task output exists and has completed".into(),
        ErrorKind::CircularDependency => "break the dependency cycle named in the error message".into(),
        ErrorKind::WorkflowCycle => "break the sub-workflow call cycle named in the error message".into(),
        ErrorKind::DepthExceeded => "reduce sub-workflow nesting or raise the configured max depth".into(),
        ErrorKind::Cancelled => "the execution was cancelled by the caller".into(),
        ErrorKind::UnknownError => "inspect the underlying error message for detail".into(),
    }
}
