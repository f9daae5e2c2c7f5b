//! Inference error types.
//!
//! These cover everything on the model side of the loop: reaching the
//! endpoint, reading its stream, and loading runtime configuration. The
//! orchestrator turns any of them into an adapter-failure turn status.

use thiserror::Error;

/// Errors that can occur while talking to a model adapter.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The adapter cannot serve requests (scripted adapter exhausted, etc.).
    #[error("model adapter unavailable: {reason}")]
    AdapterUnavailable { reason: String },
}

impl InferenceError {
    /// Whether a retry against the same endpoint could plausibly succeed.
    ///
    /// Local servers return 5xx while a model is still loading, so those are
    /// included alongside connection failures and timeouts.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 500..=504, .. }
        )
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retriable_transient_errors() {
        assert!(InferenceError::ConnectionFailed {
            endpoint: "http://localhost:1".into(),
            reason: "refused".into(),
        }
        .is_retriable());
        assert!(InferenceError::Timeout { duration_secs: 5 }.is_retriable());
        assert!(InferenceError::HttpError {
            status: 503,
            body: "loading".into(),
        }
        .is_retriable());
    }

    #[test]
    fn test_is_retriable_permanent_errors() {
        assert!(!InferenceError::HttpError {
            status: 400,
            body: "bad request".into(),
        }
        .is_retriable());
        assert!(!InferenceError::ConfigError {
            reason: "missing".into(),
        }
        .is_retriable());
        assert!(!InferenceError::StreamError {
            reason: "garbled".into(),
        }
        .is_retriable());
    }

    #[test]
    fn test_error_body_http_error() {
        let err = InferenceError::HttpError {
            status: 500,
            body: "test body".to_string(),
        };
        assert_eq!(err.error_body(), Some("test body"));
    }

    #[test]
    fn test_error_body_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.error_body().is_none());
    }

    #[test]
    fn test_display_messages() {
        let err = InferenceError::AdapterUnavailable {
            reason: "script exhausted".into(),
        };
        assert_eq!(err.to_string(), "model adapter unavailable: script exhausted");
    }
}
