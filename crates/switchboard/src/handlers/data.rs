//! Data fetch: sync lookup against a small keyed dataset.

use crate::handler::{Handler, HandlerError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use switchproto::{ErrorCode, Request};
use tokio_util::sync::CancellationToken;

pub struct DataHandler {
    datasets: HashMap<String, Value>,
}

impl DataHandler {
    pub fn new(datasets: HashMap<String, Value>) -> Self {
        Self { datasets }
    }

    /// A handful of canned datasets for local runs.
    pub fn with_defaults() -> Self {
        let mut datasets = HashMap::new();
        datasets.insert(
            "plans".to_string(),
            serde_json::json!([
                { "name": "starter", "rate_limit": 100 },
                { "name": "growth", "rate_limit": 1000 },
            ]),
        );
        datasets.insert(
            "regions".to_string(),
            serde_json::json!(["us-east-1", "us-west-2", "eu-west-1"]),
        );
        Self::new(datasets)
    }
}

#[async_trait]
impl Handler for DataHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn validate(&self, request: &Request) -> Result<(), String> {
        match request.payload.get("key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err("payload requires a non-empty string field \"key\"".to_string()),
        }
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        request: &Request,
    ) -> Result<Value, HandlerError> {
        // validate() guaranteed the field.
        let key = request
            .payload
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match self.datasets.get(key) {
            Some(value) => Ok(serde_json::json!({ "key": key, "value": value })),
            None => Err(HandlerError::processing(format!("no dataset named {key:?}"))
                .with_code(ErrorCode::NotFound)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: Value) -> Request {
        Request {
            id: "r1".into(),
            connection_id: "c1".into(),
            action: "data.fetch".into(),
            payload,
            metadata: Default::default(),
            created_at: 0,
            user_id: None,
            tenant_id: None,
        }
    }

    #[test]
    fn validate_requires_key() {
        let handler = DataHandler::with_defaults();
        assert!(handler.validate(&request(serde_json::json!({}))).is_err());
        assert!(handler
            .validate(&request(serde_json::json!({"key": ""})))
            .is_err());
        assert!(handler
            .validate(&request(serde_json::json!({"key": "plans"})))
            .is_ok());
    }

    #[tokio::test]
    async fn known_key_returns_dataset() {
        let handler = DataHandler::with_defaults();
        let data = handler
            .process(
                &CancellationToken::new(),
                &request(serde_json::json!({"key": "regions"})),
            )
            .await
            .unwrap();
        assert_eq!(data["key"], "regions");
        assert!(data["value"].is_array());
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let handler = DataHandler::with_defaults();
        let err = handler
            .process(
                &CancellationToken::new(),
                &request(serde_json::json!({"key": "nope"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(!err.retryable);
    }
}
