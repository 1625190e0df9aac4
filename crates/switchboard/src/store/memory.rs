//! In-memory store implementations backed by DashMap.
//!
//! Conditional status writes happen under the record's map entry lock, so
//! competing PENDING->PROCESSING claims resolve to one winner without any
//! extra coordination.

use super::feed::{QueueEvent, QueueFeed};
use super::records::{AsyncRequestRecord, ConnectionRecord, RequestStatus, SubscriptionRecord};
use super::{ConnectionStore, QueueStats, RequestQueue, StoreError, SubscriptionStore};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use switchproto::now_secs;
use tokio::sync::broadcast;

/// Connection records with user/tenant secondary indexes.
pub struct InMemoryConnectionStore {
    records: DashMap<String, ConnectionRecord>,
    by_user: DashMap<String, Vec<String>>,
    by_tenant: DashMap<String, Vec<String>>,
    ttl: std::time::Duration,
}

impl InMemoryConnectionStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            records: DashMap::new(),
            by_user: DashMap::new(),
            by_tenant: DashMap::new(),
            ttl,
        }
    }

    pub fn new_shared(ttl: std::time::Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    fn index_remove(index: &DashMap<String, Vec<String>>, key: &str, connection_id: &str) {
        if let Some(mut ids) = index.get_mut(key) {
            ids.retain(|id| id != connection_id);
        }
    }

    fn collect(&self, ids: Option<dashmap::mapref::one::Ref<'_, String, Vec<String>>>) -> Vec<ConnectionRecord> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.records.get(id).map(|r| r.clone()))
                .collect()
        })
        .unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn save(&self, record: ConnectionRecord) -> Result<(), StoreError> {
        self.by_user
            .entry(record.user_id.clone())
            .or_default()
            .push(record.connection_id.clone());
        self.by_tenant
            .entry(record.tenant_id.clone())
            .or_default()
            .push(record.connection_id.clone());
        self.records.insert(record.connection_id.clone(), record);
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<ConnectionRecord, StoreError> {
        self.records
            .get(connection_id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("connection", connection_id))
    }

    async fn delete(&self, connection_id: &str) -> Result<(), StoreError> {
        match self.records.remove(connection_id) {
            Some((_, record)) => {
                Self::index_remove(&self.by_user, &record.user_id, connection_id);
                Self::index_remove(&self.by_tenant, &record.tenant_id, connection_id);
                tracing::info!(connection_id, "connection record deleted");
                Ok(())
            }
            None => Err(StoreError::not_found("connection", connection_id)),
        }
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self.collect(self.by_user.get(user_id)))
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self.collect(self.by_tenant.get(tenant_id)))
    }

    async fn update_last_ping(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(connection_id)
            .ok_or_else(|| StoreError::not_found("connection", connection_id))?;
        record.touch(self.ttl);
        Ok(())
    }

    async fn delete_stale(&self, before: u64) -> Result<usize, StoreError> {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.last_ping < before)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for connection_id in stale {
            if self.delete(&connection_id).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn record_send(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(connection_id)
            .ok_or_else(|| StoreError::not_found("connection", connection_id))?;
        record.messages_sent += 1;
        Ok(())
    }

    async fn record_receive(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(connection_id)
            .ok_or_else(|| StoreError::not_found("connection", connection_id))?;
        record.messages_received += 1;
        Ok(())
    }

    async fn count(&self) -> usize {
        self.records.len()
    }
}

/// Request records plus the change feed the processor consumes.
pub struct InMemoryRequestQueue {
    records: DashMap<String, AsyncRequestRecord>,
    feed: QueueFeed,
}

impl InMemoryRequestQueue {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            feed: QueueFeed::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to insertion events (the local change-log stream).
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.feed.subscribe()
    }

    /// Conditional mutation under the entry lock. The closure sees the
    /// record only if the transition is admitted.
    fn transition(
        &self,
        request_id: &str,
        to: RequestStatus,
        mutate: impl FnOnce(&mut AsyncRequestRecord),
    ) -> Result<AsyncRequestRecord, StoreError> {
        let mut entry = self
            .records
            .get_mut(request_id)
            .ok_or_else(|| StoreError::not_found("request", request_id))?;

        if !entry.status.can_transition_to(to) {
            return Err(StoreError::conflict(
                request_id,
                format!("cannot transition {} -> {}", entry.status, to),
            ));
        }

        let now = now_secs();
        entry.status = to;
        match to {
            RequestStatus::Processing => entry.processing_started = Some(now),
            status if status.is_terminal() => entry.processing_ended = Some(now),
            _ => {}
        }
        mutate(&mut entry);

        tracing::debug!(request_id, status = %to, "request transitioned");
        Ok(entry.clone())
    }
}

impl Default for InMemoryRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestQueue for InMemoryRequestQueue {
    async fn enqueue(&self, record: AsyncRequestRecord) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        let request_id = record.request_id.clone();
        match self.records.entry(request_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::conflict(
                request_id,
                "request id already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                tracing::info!(
                    request_id = %record.request_id,
                    action = %record.action,
                    connection_id = %record.connection_id,
                    "request enqueued"
                );
                self.feed.publish(QueueEvent::Inserted(record));
                Ok(())
            }
        }
    }

    async fn get(&self, request_id: &str) -> Result<AsyncRequestRecord, StoreError> {
        self.records
            .get(request_id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("request", request_id))
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<AsyncRequestRecord>, StoreError> {
        let mut pending: Vec<AsyncRequestRecord> = self
            .records
            .iter()
            .filter(|entry| entry.status == RequestStatus::Pending)
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_status(
        &self,
        request_id: &str,
        to: RequestStatus,
        message: Option<String>,
    ) -> Result<AsyncRequestRecord, StoreError> {
        self.transition(request_id, to, |record| {
            if let Some(message) = message {
                record.progress_message = Some(message);
            }
        })
    }

    async fn update_progress(
        &self,
        request_id: &str,
        percentage: u8,
        message: Option<String>,
        details: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .records
            .get_mut(request_id)
            .ok_or_else(|| StoreError::not_found("request", request_id))?;

        // Progress is non-decreasing while PROCESSING.
        entry.progress = entry.progress.max(percentage.min(100));
        if message.is_some() {
            entry.progress_message = message;
        }
        if details.is_some() {
            entry.progress_details = details;
        }
        Ok(())
    }

    async fn complete_request(&self, request_id: &str, result: Value) -> Result<(), StoreError> {
        self.transition(request_id, RequestStatus::Completed, |record| {
            record.result = Some(result);
            record.progress = 100;
        })
        .map(|_| ())
    }

    async fn fail_request(&self, request_id: &str, error: String) -> Result<(), StoreError> {
        self.transition(request_id, RequestStatus::Failed, |record| {
            record.error = Some(error);
        })
        .map(|_| ())
    }

    async fn requeue_for_retry(
        &self,
        request_id: &str,
    ) -> Result<AsyncRequestRecord, StoreError> {
        let record = self.transition(request_id, RequestStatus::Pending, |record| {
            record.retry_count += 1;
            record.processing_started = None;
        })?;
        // Replay through the feed so a processor picks the record up again.
        self.feed.publish(QueueEvent::Inserted(record.clone()));
        Ok(record)
    }

    async fn get_by_connection(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> Result<Vec<AsyncRequestRecord>, StoreError> {
        let mut matches: Vec<AsyncRequestRecord> = self
            .records
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by_key(|r| r.created_at);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn get_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<AsyncRequestRecord>, StoreError> {
        let mut matches: Vec<AsyncRequestRecord> = self
            .records
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by_key(|r| r.created_at);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete(&self, request_id: &str) -> Result<(), StoreError> {
        self.records
            .remove(request_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("request", request_id))
    }

    async fn delete_expired(&self, now: u64) -> Result<usize, StoreError> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired.len();
        for request_id in expired {
            self.records.remove(&request_id);
        }
        Ok(removed)
    }

    async fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.records.iter() {
            stats.total += 1;
            match entry.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Processing => stats.processing += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

/// Subscriptions keyed by connection; exists to back the auto-removal
/// invariant on disconnect.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    by_connection: DashMap<String, Vec<SubscriptionRecord>>,
}

impl InMemorySubscriptionStore {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn save(&self, record: SubscriptionRecord) -> Result<(), StoreError> {
        self.by_connection
            .entry(record.connection_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn list_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self
            .by_connection
            .get(connection_id)
            .map(|records| records.clone())
            .unwrap_or_default())
    }

    async fn delete_by_connection(&self, connection_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .by_connection
            .remove(connection_id)
            .map(|(_, records)| records.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use switchproto::Request;

    fn connection(id: &str) -> ConnectionRecord {
        ConnectionRecord::new(id, "u1", "t1", "local", Duration::from_secs(3600)).unwrap()
    }

    fn pending(id: &str) -> AsyncRequestRecord {
        let request = Request {
            id: id.into(),
            connection_id: "conn-1".into(),
            action: "report.generate".into(),
            payload: Value::Null,
            metadata: Default::default(),
            created_at: now_secs(),
            user_id: None,
            tenant_id: None,
        };
        AsyncRequestRecord::from_request(&request, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn connection_indexes_follow_lifecycle() {
        let store = InMemoryConnectionStore::new(Duration::from_secs(3600));
        store.save(connection("c1")).await.unwrap();
        store.save(connection("c2")).await.unwrap();

        assert_eq!(store.list_by_user("u1").await.unwrap().len(), 2);
        assert_eq!(store.list_by_tenant("t1").await.unwrap().len(), 2);

        store.delete("c1").await.unwrap();
        assert_eq!(store.list_by_user("u1").await.unwrap().len(), 1);
        assert!(matches!(
            store.get("c1").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_stale_uses_last_ping() {
        let store = InMemoryConnectionStore::new(Duration::from_secs(3600));
        store.save(connection("c1")).await.unwrap();

        let removed = store.delete_stale(0).await.unwrap();
        assert_eq!(removed, 0);

        let removed = store.delete_stale(now_secs() + 10).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn message_counters_are_monotonic() {
        let store = InMemoryConnectionStore::new(Duration::from_secs(3600));
        store.save(connection("c1")).await.unwrap();
        store.record_send("c1").await.unwrap();
        store.record_send("c1").await.unwrap();
        store.record_receive("c1").await.unwrap();

        let record = store.get("c1").await.unwrap();
        assert_eq!(record.messages_sent, 2);
        assert_eq!(record.messages_received, 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let queue = InMemoryRequestQueue::new();
        queue.enqueue(pending("r1")).await.unwrap();
        let err = queue.enqueue(pending("r1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn enqueue_publishes_to_feed() {
        let queue = InMemoryRequestQueue::new();
        let mut feed = queue.subscribe();
        queue.enqueue(pending("r1")).await.unwrap();

        let event = feed.recv().await.unwrap();
        assert_eq!(event.record().request_id, "r1");
        assert_eq!(event.record().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn status_cas_admits_one_winner() {
        let queue = InMemoryRequestQueue::new();
        queue.enqueue(pending("r1")).await.unwrap();

        let claimed = queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap();
        assert!(claimed.processing_started.is_some());

        let err = queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let queue = InMemoryRequestQueue::new();
        queue.enqueue(pending("r1")).await.unwrap();
        queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap();
        queue
            .complete_request("r1", serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let record = queue.get("r1").await.unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.progress, 100);
        assert!(record.processing_ended.is_some());
        assert!(record.processing_started.unwrap() <= record.processing_ended.unwrap());

        let err = queue
            .fail_request("r1", "too late".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn requeue_bumps_retry_count_and_replays() {
        let queue = InMemoryRequestQueue::new();
        queue.enqueue(pending("r1")).await.unwrap();
        let mut feed = queue.subscribe();
        queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap();

        let requeued = queue.requeue_for_retry("r1").await.unwrap();
        assert_eq!(requeued.status, RequestStatus::Pending);
        assert_eq!(requeued.retry_count, 1);

        let replay = feed.recv().await.unwrap();
        assert_eq!(replay.record().retry_count, 1);
    }

    #[tokio::test]
    async fn progress_is_non_decreasing() {
        let queue = InMemoryRequestQueue::new();
        queue.enqueue(pending("r1")).await.unwrap();
        queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap();

        queue
            .update_progress("r1", 40, Some("forty".into()), None)
            .await
            .unwrap();
        queue.update_progress("r1", 10, None, None).await.unwrap();

        let record = queue.get("r1").await.unwrap();
        assert_eq!(record.progress, 40);
        assert_eq!(record.progress_message.as_deref(), Some("forty"));
    }

    #[tokio::test]
    async fn queue_indexes_and_stats() {
        let queue = InMemoryRequestQueue::new();
        queue.enqueue(pending("r1")).await.unwrap();
        queue.enqueue(pending("r2")).await.unwrap();
        queue
            .update_status("r1", RequestStatus::Processing, None)
            .await
            .unwrap();

        let by_conn = queue.get_by_connection("conn-1", 10).await.unwrap();
        assert_eq!(by_conn.len(), 2);

        let pending_only = queue
            .get_by_status(RequestStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending_only.len(), 1);
        assert_eq!(pending_only[0].request_id, "r2");

        let stats = queue.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
    }

    #[tokio::test]
    async fn dequeue_returns_oldest_pending_first() {
        let queue = InMemoryRequestQueue::new();
        let mut older = pending("r1");
        older.created_at -= 100;
        queue.enqueue(older).await.unwrap();
        queue.enqueue(pending("r2")).await.unwrap();
        queue.enqueue(pending("r3")).await.unwrap();
        queue
            .update_status("r3", RequestStatus::Processing, None)
            .await
            .unwrap();

        let batch = queue.dequeue(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].request_id, "r1");

        let limited = queue.dequeue(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn expired_records_are_swept() {
        let queue = InMemoryRequestQueue::new();
        let mut record = pending("r1");
        record.expires_at = now_secs() - 1;
        queue.enqueue(record).await.unwrap();
        queue.enqueue(pending("r2")).await.unwrap();

        let removed = queue.delete_expired(now_secs()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get("r1").await.is_err());

        queue.delete("r2").await.unwrap();
        assert!(matches!(
            queue.delete("r2").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn subscriptions_removed_with_connection() {
        let store = InMemorySubscriptionStore::default();
        store
            .save(SubscriptionRecord {
                connection_id: "c1".into(),
                request_id: "r1".into(),
                event_types: vec!["progress".into()],
                created_at: now_secs(),
            })
            .await
            .unwrap();

        assert_eq!(store.list_by_connection("c1").await.unwrap().len(), 1);
        assert_eq!(store.delete_by_connection("c1").await.unwrap(), 1);
        assert!(store.list_by_connection("c1").await.unwrap().is_empty());
    }
}
