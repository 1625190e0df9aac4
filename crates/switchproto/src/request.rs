//! The `Request` value built by the router and consumed by handlers.
//!
//! When a request is queued for deferred execution, the principal fields
//! (user/tenant) ride along inside the metadata map under a reserved key so
//! the processor can rebuild an identical `Request` from the stored record.

use crate::envelope::Envelope;
use crate::frame::now_secs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved metadata key for fields the gateway packs alongside caller
/// metadata. Caller-supplied entries under this key are dropped.
pub const RESERVED_METADATA_KEY: &str = "_switchboard";

/// A fully-resolved request, ready for validation and dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub connection_id: String,
    pub action: String,
    /// Opaque payload, preserved verbatim from the envelope.
    pub payload: Value,
    pub metadata: HashMap<String, Value>,
    /// Unix seconds.
    pub created_at: u64,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl Request {
    /// Build a request from a validated envelope and connection context.
    pub fn from_envelope(
        envelope: &Envelope,
        connection_id: impl Into<String>,
        user_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Self {
        let mut metadata = envelope.metadata.clone().unwrap_or_default();
        metadata.remove(RESERVED_METADATA_KEY);
        Self {
            id: envelope.request_id(),
            connection_id: connection_id.into(),
            action: envelope
                .action
                .clone()
                .unwrap_or_default(),
            payload: envelope.payload.clone().unwrap_or(Value::Null),
            metadata,
            created_at: now_secs(),
            user_id,
            tenant_id,
        }
    }

    /// Metadata map as stored in the queue: caller metadata plus the
    /// principal fields under [`RESERVED_METADATA_KEY`].
    pub fn pack_metadata(&self) -> HashMap<String, Value> {
        let mut packed = self.metadata.clone();
        let mut reserved = serde_json::Map::new();
        if let Some(user_id) = &self.user_id {
            reserved.insert("user_id".into(), Value::String(user_id.clone()));
        }
        if let Some(tenant_id) = &self.tenant_id {
            reserved.insert("tenant_id".into(), Value::String(tenant_id.clone()));
        }
        if !reserved.is_empty() {
            packed.insert(RESERVED_METADATA_KEY.into(), Value::Object(reserved));
        }
        packed
    }

    /// Inverse of [`Request::pack_metadata`]: split a stored metadata map
    /// into caller metadata and principal fields.
    pub fn unpack_metadata(
        mut stored: HashMap<String, Value>,
    ) -> (HashMap<String, Value>, Option<String>, Option<String>) {
        let reserved = stored.remove(RESERVED_METADATA_KEY);
        let get = |key: &str| {
            reserved
                .as_ref()
                .and_then(|v| v.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let user_id = get("user_id");
        let tenant_id = get("tenant_id");
        (stored, user_id, tenant_id)
    }
}
