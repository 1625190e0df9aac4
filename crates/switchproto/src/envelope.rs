//! Inbound request envelope.
//!
//! Every client frame is a JSON object with an `action` plus optional
//! `id`/`payload`/`metadata`. Parsing and validation are split so the
//! router can report every field fault in a single error frame instead of
//! failing on the first one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a client-supplied request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// The only inbound frame type accepted by the gateway.
pub const FRAME_TYPE_REQUEST: &str = "request";

/// Raw inbound frame. All fields optional at the serde layer so that
/// [`Envelope::validate`] can collect the full fault list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type; defaults to `"request"` when absent.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<String>,

    /// Client-supplied request id (server generates one when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Action name selecting a handler. Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Opaque payload, preserved verbatim for the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Caller metadata attached to the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

/// Envelope parse/validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    /// The frame was not valid JSON.
    #[error("malformed JSON frame: {0}")]
    Json(String),

    /// One or more fields failed validation. Each fault appears once.
    #[error("invalid envelope: {}", .faults.join("; "))]
    Invalid { faults: Vec<String> },
}

impl EnvelopeError {
    /// Structured details for the outbound error frame. Field faults are
    /// concatenated into a single payload so a batch of problems produces
    /// exactly one error frame.
    pub fn details(&self) -> Value {
        match self {
            Self::Json(msg) => serde_json::json!({ "reason": "malformed_json", "detail": msg }),
            Self::Invalid { faults } => serde_json::json!({ "faults": faults }),
        }
    }
}

impl Envelope {
    /// Parse a raw frame without validating field contents.
    pub fn parse(raw: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(raw).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    /// Validate field contents, collecting every distinct fault.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        let mut faults = Vec::new();

        if let Some(frame_type) = &self.frame_type {
            if frame_type != FRAME_TYPE_REQUEST {
                faults.push(format!(
                    "type: only \"{FRAME_TYPE_REQUEST}\" frames are accepted, got \"{frame_type}\""
                ));
            }
        }

        match self.action.as_deref() {
            None => faults.push("action: required field is missing".to_string()),
            Some("") => faults.push("action: must be non-empty".to_string()),
            Some(action) if !is_valid_action(action) => {
                faults.push(format!(
                    "action: \"{action}\" does not match [A-Za-z0-9._-]+"
                ));
            }
            Some(_) => {}
        }

        if let Some(id) = &self.id {
            if id.len() > MAX_REQUEST_ID_LEN {
                faults.push(format!(
                    "id: exceeds {MAX_REQUEST_ID_LEN} characters ({} given)",
                    id.len()
                ));
            }
        }

        if faults.is_empty() {
            Ok(())
        } else {
            Err(EnvelopeError::Invalid { faults })
        }
    }

    /// Parse and validate in one step.
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope = Self::parse(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// The request id to use: the client's when supplied, a generated one
    /// otherwise.
    pub fn request_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generate_request_id(),
        }
    }
}

/// Action-name grammar: one or more of `[A-Za-z0-9._-]`.
pub fn is_valid_action(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Generate a unique server-side request id.
pub fn generate_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_minimal_frame() {
        let envelope = Envelope::decode(br#"{"action":"echo"}"#).unwrap();
        assert_eq!(envelope.action.as_deref(), Some("echo"));
        assert_eq!(envelope.frame_type, None);
        assert_eq!(envelope.payload, None);
    }

    #[test]
    fn decode_full_frame() {
        let raw = br#"{"type":"request","id":"r1","action":"data.fetch","payload":{"k":1},"metadata":{"trace":"abc"}}"#;
        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("r1"));
        assert_eq!(envelope.action.as_deref(), Some("data.fetch"));
        assert_eq!(envelope.payload, Some(serde_json::json!({"k": 1})));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = Envelope::decode(b"{not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Json(_)));
    }

    #[test]
    fn missing_action_is_a_fault() {
        let err = Envelope::decode(br#"{"id":"r1"}"#).unwrap_err();
        match err {
            EnvelopeError::Invalid { faults } => {
                assert_eq!(faults.len(), 1);
                assert!(faults[0].starts_with("action:"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn multiple_faults_collected_once_each() {
        let long_id = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        let raw = format!(r#"{{"type":"response","id":"{long_id}","action":"bad action"}}"#);
        let err = Envelope::decode(raw.as_bytes()).unwrap_err();
        match err {
            EnvelopeError::Invalid { faults } => {
                assert_eq!(faults.len(), 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn action_grammar() {
        assert!(is_valid_action("echo"));
        assert!(is_valid_action("data.fetch-v2_beta"));
        assert!(!is_valid_action(""));
        assert!(!is_valid_action("bad action"));
        assert!(!is_valid_action("emoji🎵"));
    }

    #[test]
    fn generated_ids_are_unique_and_bounded() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("req_"));
        assert!(a.len() <= MAX_REQUEST_ID_LEN);
    }

    #[test]
    fn request_id_prefers_client_id() {
        let envelope = Envelope::decode(br#"{"action":"echo","id":"mine"}"#).unwrap();
        assert_eq!(envelope.request_id(), "mine");

        let envelope = Envelope::decode(br#"{"action":"echo"}"#).unwrap();
        assert!(envelope.request_id().starts_with("req_"));
    }
}
