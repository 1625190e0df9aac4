//! Rate-limited progress streaming for in-flight deferred requests.
//!
//! The reporter is created by the processor, bound to one request and its
//! originating connection. Frames are throttled to the configured minimum
//! interval (completion always flushes), dropped silently when the
//! connection is no longer active, and never surface errors to the
//! handler.

use crate::sender::{ConnectionManager, SendError};
use crate::store::RequestQueue;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use switchproto::{ErrorDetail, Frame};

pub struct ProgressReporter {
    request_id: String,
    connection_id: String,
    sender: Arc<ConnectionManager>,
    queue: Arc<dyn RequestQueue>,
    min_interval: Duration,
    last_emit: Mutex<Option<Instant>>,
    last_percentage: AtomicU8,
    metadata: Mutex<HashMap<String, Value>>,
}

impl ProgressReporter {
    pub fn new(
        request_id: impl Into<String>,
        connection_id: impl Into<String>,
        sender: Arc<ConnectionManager>,
        queue: Arc<dyn RequestQueue>,
        min_interval: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            connection_id: connection_id.into(),
            sender,
            queue,
            min_interval,
            last_emit: Mutex::new(None),
            last_percentage: AtomicU8::new(0),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Report progress. Never fatal: store and send failures are logged
    /// and swallowed, a dead connection drops the report silently.
    pub async fn report(&self, percentage: u8, message: &str) {
        // Progress on the wire is monotone non-decreasing.
        let clamped = percentage.min(100);
        let percentage = self
            .last_percentage
            .fetch_max(clamped, Ordering::Relaxed)
            .max(clamped);

        // Persist first so the stored record reflects progress even when
        // the frame is throttled.
        if let Err(e) = self
            .queue
            .update_progress(&self.request_id, percentage, Some(message.to_string()), None)
            .await
        {
            tracing::warn!(request_id = %self.request_id, error = %e, "failed to persist progress");
        }

        if !self.sender.is_active(&self.connection_id).await {
            tracing::debug!(
                request_id = %self.request_id,
                connection_id = %self.connection_id,
                "connection inactive; progress dropped"
            );
            return;
        }

        // Rate limit; a terminal percentage always flushes.
        if percentage < 100 {
            let last = *self.last_emit.lock().unwrap();
            if let Some(last) = last {
                if last.elapsed() < self.min_interval {
                    return;
                }
            }
        }

        let metadata = {
            let tags = self.metadata.lock().unwrap();
            (!tags.is_empty()).then(|| tags.clone())
        };
        let frame = Frame::progress(&self.request_id, percentage, message, metadata);
        match self.sender.send(&self.connection_id, &frame).await {
            Ok(()) => {
                *self.last_emit.lock().unwrap() = Some(Instant::now());
            }
            Err(e) => {
                tracing::debug!(
                    request_id = %self.request_id,
                    connection_id = %self.connection_id,
                    error = %e,
                    "progress frame dropped"
                );
            }
        }
    }

    /// Attach a cumulative tag carried on subsequent frames.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.lock().unwrap().insert(key.into(), value);
    }

    /// Emit the terminal `complete` frame.
    pub async fn complete(&self, result: Value) -> Result<(), SendError> {
        let frame = Frame::complete(&self.request_id, result);
        self.sender.send(&self.connection_id, &frame).await
    }

    /// Emit the terminal `error` frame.
    pub async fn fail(&self, error: ErrorDetail) -> Result<(), SendError> {
        let frame = Frame::error(Some(self.request_id.clone()), error);
        self.sender.send(&self.connection_id, &frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::SenderOptions;
    use crate::store::{
        AsyncRequestRecord, ConnectionRecord, ConnectionStore, InMemoryConnectionStore,
        InMemoryRequestQueue, RequestQueue, RequestStatus,
    };
    use crate::transport::LocalTransport;
    use switchproto::{Request, RetryConfig};
    use tokio::sync::mpsc;

    async fn setup(
        min_interval: Duration,
    ) -> (
        Arc<InMemoryConnectionStore>,
        Arc<InMemoryRequestQueue>,
        Arc<LocalTransport>,
        Arc<ConnectionManager>,
        mpsc::UnboundedReceiver<String>,
        ProgressReporter,
    ) {
        let store = InMemoryConnectionStore::new_shared(Duration::from_secs(3600));
        let queue = InMemoryRequestQueue::new_shared();
        let transport = LocalTransport::new_shared();
        let manager = ConnectionManager::new(
            store.clone(),
            transport.clone(),
            SenderOptions {
                pool_size: 2,
                retry: RetryConfig::default().with_base(Duration::from_millis(1)),
                circuit_trip_after: 3,
                circuit_cooldown: Duration::from_secs(30),
            },
        );

        let record =
            ConnectionRecord::new("c1", "u1", "t1", "local", Duration::from_secs(3600)).unwrap();
        store.save(record).await.unwrap();
        let rx = transport.register("c1");

        let request = Request {
            id: "r1".into(),
            connection_id: "c1".into(),
            action: "report.generate".into(),
            payload: Value::Null,
            metadata: Default::default(),
            created_at: switchproto::now_secs(),
            user_id: None,
            tenant_id: None,
        };
        let record = AsyncRequestRecord::from_request(&request, Duration::from_secs(3600));
        queue.enqueue(record).await.unwrap();
        queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap();

        let reporter = ProgressReporter::new(
            "r1",
            "c1",
            manager.clone(),
            queue.clone(),
            min_interval,
        );
        (store, queue, transport, manager, rx, reporter)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn reports_persist_and_emit() {
        let (_store, queue, _transport, _manager, mut rx, reporter) =
            setup(Duration::ZERO).await;

        reporter.report(10, "starting").await;
        reporter.report(40, "working").await;

        let record = queue.get("r1").await.unwrap();
        assert_eq!(record.progress, 40);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "progress");
        assert_eq!(frames[0]["percentage"], 10);
        assert_eq!(frames[1]["percentage"], 40);
    }

    #[tokio::test]
    async fn rate_limit_suppresses_intermediate_frames() {
        let (_store, _queue, _transport, _manager, mut rx, reporter) =
            setup(Duration::from_millis(200)).await;

        reporter.report(10, "a").await;
        reporter.report(20, "b").await;
        reporter.report(30, "c").await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1, "only the first frame within the window");
        assert_eq!(frames[0]["percentage"], 10);
    }

    #[tokio::test]
    async fn terminal_percentage_always_flushes() {
        let (_store, _queue, _transport, _manager, mut rx, reporter) =
            setup(Duration::from_millis(200)).await;

        reporter.report(10, "a").await;
        reporter.report(100, "done").await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["percentage"], 100);
    }

    #[tokio::test]
    async fn percentage_never_regresses() {
        let (_store, queue, _transport, _manager, mut rx, reporter) =
            setup(Duration::ZERO).await;

        reporter.report(70, "most").await;
        reporter.report(40, "stale update").await;

        let frames = drain(&mut rx);
        assert_eq!(frames[1]["percentage"], 70);
        assert_eq!(queue.get("r1").await.unwrap().progress, 70);
    }

    #[tokio::test]
    async fn inactive_connection_drops_silently() {
        let (store, queue, transport, _manager, mut rx, reporter) =
            setup(Duration::ZERO).await;
        transport.unregister("c1");
        store.delete("c1").await.unwrap();

        reporter.report(50, "halfway").await;

        assert!(drain(&mut rx).is_empty());
        // Progress still persisted for pollers.
        assert_eq!(queue.get("r1").await.unwrap().progress, 50);
    }

    #[tokio::test]
    async fn metadata_tags_ride_on_subsequent_frames() {
        let (_store, _queue, _transport, _manager, mut rx, reporter) =
            setup(Duration::ZERO).await;

        reporter.report(10, "plain").await;
        reporter.set_metadata("stage", serde_json::json!("render"));
        reporter.report(60, "tagged").await;

        let frames = drain(&mut rx);
        assert!(frames[0].get("metadata").is_none());
        assert_eq!(frames[1]["metadata"]["stage"], "render");
    }

    #[tokio::test]
    async fn complete_and_fail_emit_terminal_frames() {
        let (_store, _queue, _transport, _manager, mut rx, reporter) =
            setup(Duration::ZERO).await;

        reporter
            .complete(serde_json::json!({"rows": 3}))
            .await
            .unwrap();
        reporter
            .fail(ErrorDetail::processing("broke"))
            .await
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "complete");
        assert_eq!(frames[0]["result"]["rows"], 3);
        assert_eq!(frames[1]["type"], "error");
        assert_eq!(frames[1]["error"]["code"], "PROCESSING_FAILED");
    }
}
