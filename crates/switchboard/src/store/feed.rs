//! Change feed over request-queue insertions.
//!
//! In production a change-log stream drives the processor; locally the
//! in-memory queue publishes the same shape of events on a broadcast
//! channel. Delivery is at-least-once: a requeue replays the record, and
//! subscribers must tolerate duplicates.

use super::records::AsyncRequestRecord;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 1024;

/// A queue mutation surfaced to consumers as a full record.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A PENDING record landed (fresh enqueue or retry replay).
    Inserted(AsyncRequestRecord),
}

impl QueueEvent {
    pub fn record(&self) -> &AsyncRequestRecord {
        match self {
            Self::Inserted(record) => record,
        }
    }
}

/// Broadcast fan-out of queue events.
#[derive(Debug, Clone)]
pub struct QueueFeed {
    tx: broadcast::Sender<QueueEvent>,
}

impl QueueFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. With no subscriber attached the event is dropped,
    /// which is fine: the record stays PENDING and a later dequeue sweep
    /// can pick it up.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for QueueFeed {
    fn default() -> Self {
        Self::new()
    }
}
