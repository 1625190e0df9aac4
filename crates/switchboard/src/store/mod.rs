//! Store contracts and records.
//!
//! Every record is exclusively owned by its store; the rest of the system
//! consumes these capability traits only, so test doubles substitute at
//! this boundary. Not-found is distinguishable from transient failure, and
//! validation errors name the offending field.

pub mod feed;
pub mod memory;
pub mod records;

pub use feed::{QueueEvent, QueueFeed};
pub use memory::{InMemoryConnectionStore, InMemoryRequestQueue, InMemorySubscriptionStore};
pub use records::{
    AsyncRequestRecord, ConnectionRecord, RequestStatus, SubscriptionRecord, DEFAULT_MAX_RETRIES,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Store operation failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A record field violated an invariant; `field` names the offender.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Conditional write lost: the record is not in the expected state.
    #[error("conflict on {id}: {message}")]
    Conflict { id: String, message: String },

    /// Backend unreachable or overloaded; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Connection records: liveness, principal lookup, message counters.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn save(&self, record: ConnectionRecord) -> Result<(), StoreError>;
    async fn get(&self, connection_id: &str) -> Result<ConnectionRecord, StoreError>;
    async fn delete(&self, connection_id: &str) -> Result<(), StoreError>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, StoreError>;
    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<ConnectionRecord>, StoreError>;
    /// Refresh `last_ping` (monotonic) and push the TTL horizon out.
    async fn update_last_ping(&self, connection_id: &str) -> Result<(), StoreError>;
    /// Delete connections whose `last_ping` precedes `before`. Returns the
    /// number removed.
    async fn delete_stale(&self, before: u64) -> Result<usize, StoreError>;
    /// Bump the monotonic sent counter. Serialized through the sender's
    /// worker pool.
    async fn record_send(&self, connection_id: &str) -> Result<(), StoreError>;
    /// Bump the monotonic received counter.
    async fn record_receive(&self, connection_id: &str) -> Result<(), StoreError>;
    /// Number of live records (stats only).
    async fn count(&self) -> usize;
}

/// Deferred-request records and their lifecycle.
///
/// Status mutations are conditional writes: they succeed only when the
/// current status admits the transition, so duplicate change-log deliveries
/// and competing workers resolve to exactly one winner.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Insert a fresh PENDING record. An existing record under the same id
    /// is a conflict.
    async fn enqueue(&self, record: AsyncRequestRecord) -> Result<(), StoreError>;
    async fn get(&self, request_id: &str) -> Result<AsyncRequestRecord, StoreError>;
    /// Oldest PENDING records, up to `limit`.
    async fn dequeue(&self, limit: usize) -> Result<Vec<AsyncRequestRecord>, StoreError>;
    /// Conditional transition. Stamps `processing_started` on entry to
    /// PROCESSING and `processing_ended` on entry to a terminal state.
    /// Returns the updated record.
    async fn update_status(
        &self,
        request_id: &str,
        to: RequestStatus,
        message: Option<String>,
    ) -> Result<AsyncRequestRecord, StoreError>;
    /// Persist in-flight progress (non-decreasing while PROCESSING).
    async fn update_progress(
        &self,
        request_id: &str,
        percentage: u8,
        message: Option<String>,
        details: Option<Value>,
    ) -> Result<(), StoreError>;
    /// Terminal success: PROCESSING -> COMPLETED with `result`.
    async fn complete_request(&self, request_id: &str, result: Value) -> Result<(), StoreError>;
    /// Terminal failure: PROCESSING -> FAILED with `error`.
    async fn fail_request(&self, request_id: &str, error: String) -> Result<(), StoreError>;
    /// Retry requeue: PROCESSING -> PENDING with `retry_count` bumped and a
    /// re-delivery scheduled. Returns the updated record.
    async fn requeue_for_retry(&self, request_id: &str)
        -> Result<AsyncRequestRecord, StoreError>;
    async fn get_by_connection(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> Result<Vec<AsyncRequestRecord>, StoreError>;
    async fn get_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<AsyncRequestRecord>, StoreError>;
    async fn delete(&self, request_id: &str) -> Result<(), StoreError>;
    /// Delete records past their TTL. Returns the number removed.
    async fn delete_expired(&self, now: u64) -> Result<usize, StoreError>;
    /// Number of records per status (stats only).
    async fn stats(&self) -> QueueStats;
}

/// Queue statistics for health reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Subscriptions: interface-defined; the one behavioral guarantee is
/// removal alongside the owning connection.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn save(&self, record: SubscriptionRecord) -> Result<(), StoreError>;
    async fn list_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, StoreError>;
    async fn delete_by_connection(&self, connection_id: &str) -> Result<usize, StoreError>;
}

/// Spawn the periodic sweep that expires stale connections and aged-out
/// request records. Deletion failures are logged, never fatal.
pub fn spawn_sweeper(
    connections: Arc<dyn ConnectionStore>,
    queue: Arc<dyn RequestQueue>,
    connection_ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("store sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let now = switchproto::now_secs();
                    let ping_horizon = now.saturating_sub(connection_ttl.as_secs());
                    match connections.delete_stale(ping_horizon).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::info!(removed, "swept expired connections");
                        }
                        Err(e) => tracing::warn!(error = %e, "connection sweep failed"),
                    }
                    match queue.delete_expired(now).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::info!(removed, "swept expired requests");
                        }
                        Err(e) => tracing::warn!(error = %e, "request sweep failed"),
                    }
                }
            }
        }
    })
}
