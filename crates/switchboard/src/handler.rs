//! Typed handler contract.
//!
//! A handler owns one action: a cheap pre-dispatch `validate`, a declared
//! `estimated_duration` that drives the sync/async decision, a `process`
//! body, and optionally a progress-streaming variant for the deferred
//! path. Handlers that only make sense with progress must declare an
//! estimated duration above the async threshold.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchproto::{ErrorCode, ErrorDetail, Request};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;

/// Error raised by a handler body.
///
/// Fatal unless explicitly marked retryable: the processor only requeues
/// errors a handler has opted into retrying.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub code: ErrorCode,
    pub retryable: bool,
    pub details: Option<Value>,
}

impl HandlerError {
    /// Unclassified failure; surfaces as INTERNAL_ERROR.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::InternalError,
            retryable: false,
            details: None,
        }
    }

    /// Processing failure with a meaningful message for the client.
    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::ProcessingFailed,
            retryable: false,
            details: None,
        }
    }

    /// Transient downstream failure; opts into a retry requeue.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::ServiceUnavailable,
            retryable: true,
            details: None,
        }
    }

    /// Cooperative abort on a cancelled context.
    pub fn cancelled() -> Self {
        Self {
            message: "cancelled".to_string(),
            code: ErrorCode::ProcessingFailed,
            retryable: false,
            details: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_detail(&self) -> ErrorDetail {
        let mut detail = ErrorDetail::new(self.code, self.message.clone());
        detail.details = self.details.clone();
        detail
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// A shareable handler.
pub type BoxedHandler = Arc<dyn Handler>;

/// One action's processor.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Upper bound on expected wall-clock. Above the async threshold the
    /// router queues instead of executing in-line.
    fn estimated_duration(&self) -> Duration;

    /// Cheap pre-dispatch check; the failure message reaches the client in
    /// a VALIDATION_ERROR frame.
    fn validate(&self, request: &Request) -> Result<(), String> {
        let _ = request;
        Ok(())
    }

    /// Synchronous execution path.
    async fn process(
        &self,
        ctx: &CancellationToken,
        request: &Request,
    ) -> Result<Value, HandlerError>;

    /// Whether the deferred path should stream progress.
    fn supports_progress(&self) -> bool {
        false
    }

    /// Deferred execution path with progress streaming. Defaults to the
    /// plain body.
    async fn process_with_progress(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        reporter: &ProgressReporter,
    ) -> Result<Value, HandlerError> {
        let _ = reporter;
        self.process(ctx, request).await
    }
}
