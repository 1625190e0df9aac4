//! Durable records owned by the stores.
//!
//! The router creates `AsyncRequestRecord`s, the processor mutates their
//! lifecycle fields, and the connection manager touches connection
//! liveness/counters. Nothing else writes these.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use switchproto::{now_secs, Request};

use super::StoreError;

/// Default retry budget for a deferred request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// An active client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Gateway-assigned id, stable for the session lifetime.
    pub connection_id: String,
    pub user_id: String,
    pub tenant_id: String,
    /// Callback address of the upstream gateway; required for send.
    pub endpoint: String,
    pub permissions: Vec<String>,
    /// Unix seconds.
    pub connected_at: u64,
    /// Unix seconds; monotonically non-decreasing.
    pub last_ping: u64,
    /// Absolute expiry: `last_ping + ttl`.
    pub expires_at: u64,
    pub metadata: HashMap<String, String>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl ConnectionRecord {
    /// Create a record, enforcing the non-empty-field invariants.
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        endpoint: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        let connection_id = connection_id.into();
        let user_id = user_id.into();
        let tenant_id = tenant_id.into();
        let endpoint = endpoint.into();

        for (field, value) in [
            ("connection_id", &connection_id),
            ("user_id", &user_id),
            ("tenant_id", &tenant_id),
            ("endpoint", &endpoint),
        ] {
            if value.is_empty() {
                return Err(StoreError::Validation {
                    field,
                    message: "must be non-empty".to_string(),
                });
            }
        }

        let now = now_secs();
        Ok(Self {
            connection_id,
            user_id,
            tenant_id,
            endpoint,
            permissions: Vec::new(),
            connected_at: now,
            last_ping: now,
            expires_at: now + ttl.as_secs(),
            metadata: HashMap::new(),
            messages_sent: 0,
            messages_received: 0,
        })
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Refresh liveness. `last_ping` never moves backward.
    pub fn touch(&mut self, ttl: Duration) {
        let now = now_secs();
        if now > self.last_ping {
            self.last_ping = now;
            self.expires_at = now + ttl.as_secs();
        }
    }
}

/// Lifecycle of a deferred request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The allowed transition set. `Processing -> Pending` is the retry
    /// requeue; terminal states admit nothing.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Cancelled),
            Self::Processing => matches!(
                next,
                Self::Completed | Self::Failed | Self::Cancelled | Self::Pending
            ),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncRequestRecord {
    pub request_id: String,
    pub connection_id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub action: String,
    pub payload: Value,
    /// Packed metadata (caller metadata plus the reserved gateway key).
    pub metadata: HashMap<String, Value>,
    pub status: RequestStatus,
    pub created_at: u64,
    pub processing_started: Option<u64>,
    pub processing_ended: Option<u64>,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub progress_details: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub expires_at: u64,
}

impl AsyncRequestRecord {
    /// Pack a routed request into a PENDING record.
    pub fn from_request(request: &Request, ttl: Duration) -> Self {
        Self {
            request_id: request.id.clone(),
            connection_id: request.connection_id.clone(),
            user_id: request.user_id.clone(),
            tenant_id: request.tenant_id.clone(),
            action: request.action.clone(),
            payload: request.payload.clone(),
            metadata: request.pack_metadata(),
            status: RequestStatus::Pending,
            created_at: request.created_at,
            processing_started: None,
            processing_ended: None,
            progress: 0,
            progress_message: None,
            progress_details: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            expires_at: request.created_at + ttl.as_secs(),
        }
    }

    /// Inverse of [`AsyncRequestRecord::from_request`]: rebuild the request
    /// the router packed, restoring the principal fields from the reserved
    /// metadata key.
    pub fn restore_request(&self) -> Request {
        let (metadata, user_id, tenant_id) = Request::unpack_metadata(self.metadata.clone());
        Request {
            id: self.request_id.clone(),
            connection_id: self.connection_id.clone(),
            action: self.action.clone(),
            payload: self.payload.clone(),
            metadata,
            created_at: self.created_at,
            user_id: user_id.or_else(|| self.user_id.clone()),
            tenant_id: tenant_id.or_else(|| self.tenant_id.clone()),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// A connection's interest in update streams for a request.
///
/// Interface-defined only: the single behavioral guarantee is removal when
/// the owning connection is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub connection_id: String,
    pub request_id: String,
    pub event_types: Vec<String>,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> Request {
        Request {
            id: "r1".into(),
            connection_id: "conn-1".into(),
            action: "report.generate".into(),
            payload: serde_json::json!({"report_type": "daily"}),
            metadata: [("trace".to_string(), serde_json::json!("abc"))]
                .into_iter()
                .collect(),
            created_at: now_secs(),
            user_id: Some("u1".into()),
            tenant_id: Some("t1".into()),
        }
    }

    #[test]
    fn connection_record_rejects_empty_fields() {
        let err = ConnectionRecord::new("", "u", "t", "e", Duration::from_secs(60)).unwrap_err();
        match err {
            StoreError::Validation { field, .. } => assert_eq!(field, "connection_id"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = ConnectionRecord::new("c", "u", "t", "", Duration::from_secs(60)).unwrap_err();
        match err {
            StoreError::Validation { field, .. } => assert_eq!(field, "endpoint"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn touch_never_moves_last_ping_backward() {
        let mut record =
            ConnectionRecord::new("c", "u", "t", "e", Duration::from_secs(60)).unwrap();
        let original = record.last_ping;
        record.touch(Duration::from_secs(60));
        assert!(record.last_ping >= original);
    }

    #[test]
    fn status_transitions() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Cancelled));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RequestStatus::Pending).unwrap();
        assert_eq!(json, r#""PENDING""#);
    }

    #[test]
    fn record_round_trip_restores_request() {
        let original = request();
        let record = AsyncRequestRecord::from_request(&original, Duration::from_secs(600));
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(record.max_retries, DEFAULT_MAX_RETRIES);

        let restored = record.restore_request();
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.action, original.action);
        assert_eq!(restored.connection_id, original.connection_id);
        assert_eq!(restored.payload, original.payload);
        assert_eq!(restored.metadata, original.metadata);
        assert_eq!(restored.user_id, original.user_id);
        assert_eq!(restored.tenant_id, original.tenant_id);
    }
}
