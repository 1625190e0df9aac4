//! Deferred execution engine.
//!
//! Consumes the change feed of queued request records. Each event is
//! claimed with a conditional PENDING -> PROCESSING transition, so
//! duplicate deliveries and competing instances resolve to one executor
//! per record. Terminal writes are conditional too: a second delivery
//! after completion is a no-op and emits no duplicate frame.

use crate::handler::BoxedHandler;
use crate::progress::ProgressReporter;
use crate::sender::ConnectionManager;
use crate::store::{AsyncRequestRecord, QueueEvent, RequestQueue, RequestStatus, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchproto::ErrorDetail;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub struct Processor {
    queue: Arc<dyn RequestQueue>,
    handlers: Arc<HashMap<String, BoxedHandler>>,
    sender: Arc<ConnectionManager>,
    progress_interval: Duration,
    cancel: CancellationToken,
}

impl Processor {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        handlers: Arc<HashMap<String, BoxedHandler>>,
        sender: Arc<ConnectionManager>,
        progress_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            handlers,
            sender,
            progress_interval,
            cancel,
        })
    }

    /// Consume the change feed until cancelled or the feed closes.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<QueueEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("processor shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Ok(QueueEvent::Inserted(record)) => self.handle_event(record).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Skipped records stay PENDING; a dequeue sweep or
                        // replay will surface them again.
                        tracing::warn!(skipped, "change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("change feed closed; processor exiting");
                        break;
                    }
                },
            }
        }
    }

    /// Execute one change-feed event end to end.
    pub async fn handle_event(&self, record: AsyncRequestRecord) {
        // Only fresh PENDING insertions (and retry replays, also PENDING)
        // are processable.
        if record.status != RequestStatus::Pending {
            return;
        }

        // Claim the record. Losing the conditional write means another
        // worker owns it or this is a duplicate delivery.
        let claimed = match self
            .queue
            .update_status(&record.request_id, RequestStatus::Processing, None)
            .await
        {
            Ok(claimed) => claimed,
            Err(StoreError::Conflict { .. }) => {
                tracing::debug!(request_id = %record.request_id, "claim lost; skipping");
                return;
            }
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!(request_id = %record.request_id, "record gone before claim");
                return;
            }
            Err(e) => {
                // Transient store fault: the record stays PENDING for a
                // later replay.
                tracing::warn!(request_id = %record.request_id, error = %e, "claim failed");
                return;
            }
        };

        let reporter = ProgressReporter::new(
            claimed.request_id.clone(),
            claimed.connection_id.clone(),
            Arc::clone(&self.sender),
            Arc::clone(&self.queue),
            self.progress_interval,
        );

        let Some(handler) = self.handlers.get(&claimed.action) else {
            let message = format!("unknown action: {}", claimed.action);
            tracing::warn!(request_id = %claimed.request_id, action = %claimed.action, "{message}");
            match self.queue.fail_request(&claimed.request_id, message).await {
                Ok(()) => {
                    if let Err(e) = reporter.fail(ErrorDetail::invalid_action(&claimed.action)).await
                    {
                        tracing::debug!(request_id = %claimed.request_id, error = %e, "terminal error frame dropped");
                    }
                }
                Err(e) => {
                    tracing::warn!(request_id = %claimed.request_id, error = %e, "failed to mark unknown action terminal");
                }
            }
            return;
        };

        let request = claimed.restore_request();
        tracing::info!(
            request_id = %request.id,
            action = %request.action,
            retry = claimed.retry_count,
            "processing deferred request"
        );

        let result = if handler.supports_progress() {
            handler
                .process_with_progress(&self.cancel, &request, &reporter)
                .await
        } else {
            handler.process(&self.cancel, &request).await
        };

        match result {
            Ok(result) => {
                match self
                    .queue
                    .complete_request(&request.id, result.clone())
                    .await
                {
                    Ok(()) => {
                        if let Err(e) = reporter.complete(result).await {
                            tracing::debug!(request_id = %request.id, error = %e, "complete frame dropped");
                        }
                    }
                    Err(StoreError::Conflict { .. }) => {
                        tracing::debug!(request_id = %request.id, "terminal write lost; duplicate delivery");
                    }
                    Err(e) => {
                        tracing::warn!(request_id = %request.id, error = %e, "failed to persist completion");
                    }
                }
            }
            Err(e) if e.retryable && claimed.retries_left() => {
                match self.queue.requeue_for_retry(&request.id).await {
                    Ok(requeued) => {
                        tracing::info!(
                            request_id = %request.id,
                            retry = requeued.retry_count,
                            max_retries = requeued.max_retries,
                            error = %e,
                            "retryable failure; requeued"
                        );
                    }
                    Err(StoreError::Conflict { .. }) => {
                        tracing::debug!(request_id = %request.id, "requeue lost; duplicate delivery");
                    }
                    Err(store_err) => {
                        tracing::warn!(request_id = %request.id, error = %store_err, "requeue failed");
                    }
                }
            }
            Err(e) => {
                match self.queue.fail_request(&request.id, e.message.clone()).await {
                    Ok(()) => {
                        if let Err(send_err) = reporter.fail(e.to_detail()).await {
                            tracing::debug!(request_id = %request.id, error = %send_err, "terminal error frame dropped");
                        }
                    }
                    Err(StoreError::Conflict { .. }) => {
                        tracing::debug!(request_id = %request.id, "terminal write lost; duplicate delivery");
                    }
                    Err(store_err) => {
                        tracing::warn!(request_id = %request.id, error = %store_err, "failed to persist failure");
                    }
                }
            }
        }
    }
}
