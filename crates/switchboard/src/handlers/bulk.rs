//! Bulk processing: deferred per-item work with streamed progress.

use crate::handler::{Handler, HandlerError};
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use switchproto::Request;
use tokio_util::sync::CancellationToken;

const MAX_ITEMS: usize = 10_000;

pub struct BulkHandler {
    item_delay: Duration,
}

impl BulkHandler {
    pub fn new(item_delay: Duration) -> Self {
        Self { item_delay }
    }
}

impl Default for BulkHandler {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl BulkHandler {
    async fn run(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        reporter: Option<&ProgressReporter>,
    ) -> Result<Value, HandlerError> {
        let items = request
            .payload
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let total = items.len();
        let mut processed = 0usize;
        let mut failed = 0usize;

        for (index, item) in items.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(HandlerError::cancelled());
            }
            tokio::time::sleep(self.item_delay).await;

            if item.get("fail").and_then(Value::as_bool) == Some(true) {
                failed += 1;
            } else {
                processed += 1;
            }

            if let Some(reporter) = reporter {
                let percentage = (((index + 1) * 100) / total) as u8;
                reporter
                    .report(percentage, &format!("processed {}/{total} items", index + 1))
                    .await;
            }
        }

        Ok(serde_json::json!({
            "total": total,
            "processed": processed,
            "failed": failed,
        }))
    }
}

#[async_trait]
impl Handler for BulkHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn validate(&self, request: &Request) -> Result<(), String> {
        match request.payload.get("items").and_then(Value::as_array) {
            None => Err("payload requires an array field \"items\"".to_string()),
            Some(items) if items.is_empty() => Err("\"items\" must be non-empty".to_string()),
            Some(items) if items.len() > MAX_ITEMS => {
                Err(format!("\"items\" exceeds the {MAX_ITEMS} item limit"))
            }
            Some(_) => Ok(()),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: Value) -> Request {
        Request {
            id: "r1".into(),
            connection_id: "c1".into(),
            action: "bulk.process".into(),
            payload,
            metadata: Default::default(),
            created_at: 0,
            user_id: None,
            tenant_id: None,
        }
    }

    #[test]
    fn validate_requires_non_empty_items() {
        let handler = BulkHandler::default();
        assert!(handler.validate(&request(serde_json::json!({}))).is_err());
        assert!(handler
            .validate(&request(serde_json::json!({"items": []})))
            .is_err());
        assert!(handler
            .validate(&request(serde_json::json!({"items": [1, 2]})))
            .is_ok());
    }

    #[tokio::test]
    async fn counts_failures_per_item() {
        let handler = BulkHandler::new(Duration::ZERO);
        let data = handler
            .process(
                &CancellationToken::new(),
                &request(serde_json::json!({"items": [
                    {"id": 1},
                    {"id": 2, "fail": true},
                    {"id": 3},
                ]})),
            )
            .await
            .unwrap();
        assert_eq!(data["total"], 3);
        assert_eq!(data["processed"], 2);
        assert_eq!(data["failed"], 1);
    }
}
