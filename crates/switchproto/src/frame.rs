//! Outbound frames.
//!
//! Everything the gateway sends to a client is one of five frame kinds,
//! discriminated by the `type` field in serialized form. Timestamps are
//! Unix seconds.

use crate::error::ErrorDetail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Outbound frame sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Synchronous result of an in-line executed request.
    Response {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
        timestamp: u64,
    },

    /// The request was queued for deferred execution.
    Acknowledgment {
        request_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: u64,
    },

    /// In-flight progress for a deferred request.
    Progress {
        request_id: String,
        percentage: u8,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, Value>>,
        timestamp: u64,
    },

    /// Terminal success of a deferred request.
    Complete {
        request_id: String,
        result: Value,
        timestamp: u64,
    },

    /// Any failure, sync or async.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: ErrorDetail,
        timestamp: u64,
    },
}

impl Frame {
    /// Successful sync response.
    pub fn response(request_id: impl Into<String>, data: Value) -> Self {
        Self::Response {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_secs(),
        }
    }

    /// Sync response carrying a structured handler error.
    pub fn response_error(request_id: impl Into<String>, error: ErrorDetail) -> Self {
        Self::Response {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error),
            timestamp: now_secs(),
        }
    }

    /// Queued acknowledgment for the async path.
    pub fn acknowledgment(request_id: impl Into<String>, message: Option<String>) -> Self {
        Self::Acknowledgment {
            request_id: request_id.into(),
            status: "queued".to_string(),
            message,
            timestamp: now_secs(),
        }
    }

    /// Progress update; `percentage` is clamped to 100.
    pub fn progress(
        request_id: impl Into<String>,
        percentage: u8,
        message: impl Into<String>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Self {
        Self::Progress {
            request_id: request_id.into(),
            percentage: percentage.min(100),
            message: message.into(),
            metadata,
            timestamp: now_secs(),
        }
    }

    /// Terminal completion.
    pub fn complete(request_id: impl Into<String>, result: Value) -> Self {
        Self::Complete {
            request_id: request_id.into(),
            result,
            timestamp: now_secs(),
        }
    }

    /// Error frame, optionally tied to a request.
    pub fn error(request_id: Option<String>, error: ErrorDetail) -> Self {
        Self::Error {
            request_id,
            error,
            timestamp: now_secs(),
        }
    }

    /// Request id this frame refers to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Response { request_id, .. }
            | Self::Acknowledgment { request_id, .. }
            | Self::Progress { request_id, .. }
            | Self::Complete { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Serialize for the gateway edge. Serialization of a frame we built
    /// ourselves cannot fail; the fallback keeps the edge from ever seeing
    /// a non-frame.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "type": "error",
                "error": {
                    "code": "INTERNAL_ERROR",
                    "message": format!("frame serialization failed: {e}"),
                },
                "timestamp": now_secs(),
            })
        })
    }
}
