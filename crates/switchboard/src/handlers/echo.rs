//! Echo: the smallest possible sync handler.

use crate::handler::{Handler, HandlerError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use switchproto::Request;
use tokio_util::sync::CancellationToken;

pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        request: &Request,
    ) -> Result<Value, HandlerError> {
        Ok(serde_json::json!({ "echo": request.payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_payload_verbatim() {
        let request = Request {
            id: "r1".into(),
            connection_id: "c1".into(),
            action: "echo".into(),
            payload: serde_json::json!({"m": "hi"}),
            metadata: Default::default(),
            created_at: 0,
            user_id: None,
            tenant_id: None,
        };

        let data = EchoHandler
            .process(&CancellationToken::new(), &request)
            .await
            .unwrap();
        assert_eq!(data["echo"]["m"], "hi");
    }
}
