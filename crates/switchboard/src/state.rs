//! Shared application state: stores, sender, router, background tasks.

use crate::auth::TokenVerifier;
use crate::handlers::register_builtins;
use crate::processor::Processor;
use crate::router::{LoggingMiddleware, Router, RouterBuilder, RouterOptions};
use crate::sender::{ConnectionManager, SenderOptions};
use crate::store::{
    spawn_sweeper, ConnectionStore, InMemoryConnectionStore, InMemoryRequestQueue,
    InMemorySubscriptionStore, RequestQueue, SubscriptionStore,
};
use crate::transport::LocalTransport;
use std::sync::Arc;
use std::time::Duration;
use switchconf::SwitchConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: SwitchConfig,
    pub connections: Arc<InMemoryConnectionStore>,
    pub queue: Arc<InMemoryRequestQueue>,
    pub subscriptions: Arc<InMemorySubscriptionStore>,
    pub sender: Arc<ConnectionManager>,
    pub router: Arc<Router>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub transport: Arc<LocalTransport>,
    pub cancel: CancellationToken,
}

impl AppState {
    /// Wire the whole system with the built-in handlers and the local
    /// in-process transport.
    pub fn build(
        config: SwitchConfig,
        verifier: Arc<dyn TokenVerifier>,
    ) -> anyhow::Result<Arc<Self>> {
        let connections = InMemoryConnectionStore::new_shared(config.ttl.connection_ttl());
        let queue = InMemoryRequestQueue::new_shared();
        let subscriptions = InMemorySubscriptionStore::new_shared();
        let transport = LocalTransport::new_shared();

        let sender = ConnectionManager::new(
            connections.clone() as Arc<dyn ConnectionStore>,
            transport.clone(),
            SenderOptions::from(&config.sender),
        );

        let router = register_builtins(RouterBuilder::new().middleware(LoggingMiddleware))?
            .build(
                connections.clone() as Arc<dyn ConnectionStore>,
                queue.clone() as Arc<dyn RequestQueue>,
                sender.clone(),
                RouterOptions::from(&config),
            );

        Ok(Arc::new(Self {
            config,
            connections,
            queue,
            subscriptions,
            sender,
            router: Arc::new(router),
            verifier,
            transport,
            cancel: CancellationToken::new(),
        }))
    }

    /// Spawn the processor and the store sweeper.
    pub fn spawn_background(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let processor = Processor::new(
            self.queue.clone() as Arc<dyn RequestQueue>,
            self.router.handlers(),
            self.sender.clone(),
            self.config.progress.interval_min(),
            self.cancel.clone(),
        );
        let events = self.queue.subscribe();
        let processor_task = tokio::spawn(processor.run(events));

        let sweeper_task = spawn_sweeper(
            self.connections.clone() as Arc<dyn ConnectionStore>,
            self.queue.clone() as Arc<dyn RequestQueue>,
            self.config.ttl.connection_ttl(),
            SWEEP_INTERVAL,
            self.cancel.clone(),
        );

        (processor_task, sweeper_task)
    }

    /// Disconnect cleanup. Always succeeds from the caller's point of
    /// view; the transport is already closed, so failures are logged only.
    pub async fn cleanup_connection(&self, connection_id: &str) {
        self.transport.unregister(connection_id);

        // Cancel the connection's non-terminal requests.
        match self.queue.get_by_connection(connection_id, usize::MAX).await {
            Ok(records) => {
                for record in records {
                    if record.status.is_terminal() {
                        continue;
                    }
                    if let Err(e) = self
                        .queue
                        .update_status(
                            &record.request_id,
                            crate::store::RequestStatus::Cancelled,
                            Some("connection closed".to_string()),
                        )
                        .await
                    {
                        tracing::warn!(
                            request_id = %record.request_id,
                            error = %e,
                            "failed to cancel request during disconnect cleanup"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "failed to list requests during cleanup");
            }
        }

        // Subscriptions go with the connection.
        if let Err(e) = self.subscriptions.delete_by_connection(connection_id).await {
            tracing::warn!(connection_id, error = %e, "failed to delete subscriptions");
        }

        match self.connections.delete(connection_id).await {
            Ok(()) => tracing::info!(connection_id, "connection cleaned up"),
            Err(crate::store::StoreError::NotFound { .. }) => {
                tracing::debug!(connection_id, "connection already reaped");
            }
            Err(e) => tracing::warn!(connection_id, error = %e, "failed to delete connection"),
        }
    }

    /// Health snapshot: store stats plus sender metrics.
    pub async fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "connections": self.connections.count().await,
            "queue": self.queue.stats().await,
            "sender": self.sender.metrics(),
        })
    }
}
