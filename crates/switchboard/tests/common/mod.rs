//! Shared wiring for integration tests: in-memory stores, the local
//! transport, a sender with fast retries, and a router/processor pair
//! registered by the caller.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchboard::processor::Processor;
use switchboard::router::{Router, RouterBuilder, RouterOptions};
use switchboard::sender::{ConnectionManager, SenderOptions};
use switchboard::store::{
    ConnectionRecord, ConnectionStore, InMemoryConnectionStore, InMemoryRequestQueue,
    RequestQueue, RequestStatus,
};
use switchboard::transport::LocalTransport;
use switchproto::RetryConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub connections: Arc<InMemoryConnectionStore>,
    pub queue: Arc<InMemoryRequestQueue>,
    pub transport: Arc<LocalTransport>,
    pub sender: Arc<ConnectionManager>,
    pub router: Arc<Router>,
    pub processor: Arc<Processor>,
    pub cancel: CancellationToken,
}

impl Harness {
    /// Build the system with the caller's handler registrations.
    pub fn new(register: impl FnOnce(RouterBuilder) -> RouterBuilder) -> Self {
        Self::with_threshold(Duration::from_secs(5), register)
    }

    /// Same, with a custom async threshold.
    pub fn with_threshold(
        async_threshold: Duration,
        register: impl FnOnce(RouterBuilder) -> RouterBuilder,
    ) -> Self {
        let connections = InMemoryConnectionStore::new_shared(Duration::from_secs(3600));
        let queue = InMemoryRequestQueue::new_shared();
        let transport = LocalTransport::new_shared();
        let cancel = CancellationToken::new();

        let sender = ConnectionManager::new(
            connections.clone() as Arc<dyn ConnectionStore>,
            transport.clone(),
            SenderOptions {
                pool_size: 4,
                retry: RetryConfig::default().with_base(Duration::from_millis(1)),
                circuit_trip_after: 3,
                circuit_cooldown: Duration::from_secs(30),
            },
        );

        let router = register(RouterBuilder::new()).build(
            connections.clone() as Arc<dyn ConnectionStore>,
            queue.clone() as Arc<dyn RequestQueue>,
            sender.clone(),
            RouterOptions {
                async_threshold,
                payload_max_bytes: 1_048_576,
                request_ttl: Duration::from_secs(7 * 86_400),
            },
        );
        let router = Arc::new(router);

        // Progress interval zero so tests observe every frame.
        let processor = Processor::new(
            queue.clone() as Arc<dyn RequestQueue>,
            router.handlers(),
            sender.clone(),
            Duration::ZERO,
            cancel.clone(),
        );

        Self {
            connections,
            queue,
            transport,
            sender,
            router,
            processor,
            cancel,
        }
    }

    /// Create a connection record and its outbound frame channel.
    pub async fn connect(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let record = ConnectionRecord::new(
            connection_id,
            "u1",
            "t1",
            "local",
            Duration::from_secs(3600),
        )
        .unwrap();
        self.connections.save(record).await.unwrap();
        self.transport.register(connection_id)
    }

    /// Route a raw frame; panics on infrastructure failure.
    pub async fn route(&self, connection_id: &str, raw: &str) {
        self.router
            .route(&self.cancel, raw.as_bytes(), connection_id)
            .await
            .unwrap();
    }

    /// Start the processor on the live change feed.
    pub fn start_processor(&self) -> tokio::task::JoinHandle<()> {
        let events = self.queue.subscribe();
        tokio::spawn(self.processor.clone().run(events))
    }

    /// Wait until the record reaches a terminal status.
    pub async fn wait_terminal(&self, request_id: &str) -> RequestStatus {
        for _ in 0..200 {
            if let Ok(record) = self.queue.get(request_id).await {
                if record.status.is_terminal() {
                    return record.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {request_id} never reached a terminal status");
    }
}

/// Drain every frame currently buffered on a connection channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

/// Receive the next frame within a timeout.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed");
    serde_json::from_str(&frame).unwrap()
}
