//! Built-in reference handlers.
//!
//! `echo` and `data.fetch` run in-line; `report.generate` and
//! `bulk.process` declare durations above the async threshold and stream
//! progress from the processor. `ping` keeps connections warm.

pub mod bulk;
pub mod data;
pub mod echo;
pub mod report;

pub use bulk::BulkHandler;
pub use data::DataHandler;
pub use echo::EchoHandler;
pub use report::ReportHandler;

use crate::handler::{Handler, HandlerError};
use crate::router::{RegistryError, RouterBuilder};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use switchproto::{now_secs, Request};
use tokio_util::sync::CancellationToken;

/// Liveness check; the adapter refreshes `last_ping` on every inbound
/// frame, this handler just answers.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(5)
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        _request: &Request,
    ) -> Result<Value, HandlerError> {
        Ok(serde_json::json!({ "pong": true, "timestamp": now_secs() }))
    }
}

/// Register every built-in on a builder.
pub fn register_builtins(builder: RouterBuilder) -> Result<RouterBuilder, RegistryError> {
    builder
        .handle("ping", PingHandler)?
        .handle("echo", EchoHandler)?
        .handle("data.fetch", DataHandler::with_defaults())?
        .handle("report.generate", ReportHandler::default())?
        .handle("bulk.process", BulkHandler::default())
}
