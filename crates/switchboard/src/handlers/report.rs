//! Report generation: the canonical deferred handler.
//!
//! Declares a duration far above the async threshold, so the router always
//! queues it. The body walks fixed phases and streams progress; payload
//! knobs (`fail`, `flaky`) exercise the fatal and retryable error paths.

use crate::handler::{Handler, HandlerError};
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use switchproto::{now_secs, Request};
use tokio_util::sync::CancellationToken;

const PHASES: &[(u8, &str)] = &[
    (10, "collecting source data"),
    (40, "aggregating"),
    (70, "rendering"),
    (100, "finalizing"),
];

pub struct ReportHandler {
    /// Simulated work per phase; kept tiny in tests.
    step_delay: Duration,
}

impl ReportHandler {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for ReportHandler {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl ReportHandler {
    async fn run(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        reporter: Option<&ProgressReporter>,
    ) -> Result<Value, HandlerError> {
        let report_type = request
            .payload
            .get("report_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if request.payload.get("flaky").and_then(Value::as_bool) == Some(true) {
            return Err(HandlerError::retryable("report source temporarily unavailable"));
        }
        if request.payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(HandlerError::processing(format!(
                "report build failed for {report_type:?}"
            )));
        }

        for (percentage, message) in PHASES {
            if ctx.is_cancelled() {
                return Err(HandlerError::cancelled());
            }
            tokio::time::sleep(self.step_delay).await;
            if let Some(reporter) = reporter {
                reporter.report(*percentage, message).await;
            }
        }

        Ok(serde_json::json!({
            "report_type": report_type,
            "rows": 128,
            "generated_at": now_secs(),
        }))
    }
}

#[async_trait]
impl Handler for ReportHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn validate(&self, request: &Request) -> Result<(), String> {
        match request.payload.get("report_type").and_then(Value::as_str) {
            Some(kind) if !kind.is_empty() => Ok(()),
            _ => Err("payload requires a non-empty string field \"report_type\"".to_string()),
        }
    }

    fn supports_progress(&self) -> bool {
        true
    }

    async fn process(
        &self,
        ctx: &CancellationToken,
        request: &Request,
    ) -> Result<Value, HandlerError> {
        self.run(ctx, request, None).await
    }

    async fn process_with_progress(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        reporter: &ProgressReporter,
    ) -> Result<Value, HandlerError> {
        self.run(ctx, request, Some(reporter)).await
    }
}
