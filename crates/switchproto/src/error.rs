//! Error taxonomy shared across the gateway.
//!
//! Every outbound error frame carries a stable [`ErrorCode`] plus an
//! optional retry hint. Retryability is a property of the code class:
//! transient server faults invite retries, client faults never do.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope, schema violation, oversized payload, or a
    /// handler validate-failure.
    ValidationError,
    /// Unknown action name.
    InvalidAction,
    /// Missing or invalid token at connection establishment.
    Unauthorized,
    /// Store lookup miss.
    NotFound,
    /// Same request id already reached a terminal state.
    DuplicateRequest,
    /// Administrative throttle (reserved).
    RateLimited,
    /// Operation timed out; retryable.
    Timeout,
    /// Downstream dependency unavailable; retryable.
    ServiceUnavailable,
    /// Store operation failed.
    StorageError,
    /// Handler raised during processing.
    ProcessingFailed,
    /// Unclassified failure.
    InternalError,
    /// Transport-layer: connection closed mid-operation.
    ConnectionClosed,
    /// Transport-layer: frame could not be interpreted.
    InvalidMessage,
    /// Transport-layer: protocol sequencing violation.
    ProtocolError,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidAction => "INVALID_ACTION",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::DuplicateRequest => "DUPLICATE_REQUEST",
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::StorageError => "STORAGE_ERROR",
            Self::ProcessingFailed => "PROCESSING_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::ProtocolError => "PROTOCOL_ERROR",
        }
    }

    /// Whether clients may retry the same request for this code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ServiceUnavailable | Self::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry guidance attached to retryable errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHint {
    pub retryable: bool,
    /// Suggested wait before retrying, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
}

impl RetryHint {
    pub fn for_code(code: ErrorCode) -> Self {
        Self {
            retryable: code.is_retryable(),
            after: code.is_retryable().then_some(1),
            max_tries: code.is_retryable().then_some(3),
        }
    }
}

/// Error body carried inside `response` and `error` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryHint>,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry: Some(RetryHint::for_code(code)),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn invalid_action(action: &str) -> Self {
        Self::new(
            ErrorCode::InvalidAction,
            format!("unknown action: {action}"),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{resource} not found: {id}"))
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProcessingFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}
