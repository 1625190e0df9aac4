//! Gateway-management transport.
//!
//! The connection manager pushes frames through a single POST primitive
//! whose outcomes classify as success, gone, or transient. The concrete
//! transport is pluggable: HTTP callback against the upstream gateway's
//! management endpoint in production, an in-process channel registry for
//! the local adapter and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Classified delivery failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection's endpoint reported the peer gone; the record should
    /// be reaped.
    #[error("connection gone")]
    Gone,

    /// Network / 5xx class failure; eligible for retry.
    #[error("transient send failure: {0}")]
    Transient(String),
}

/// The single primitive the connection manager consumes.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn post(
        &self,
        connection_id: &str,
        endpoint: &str,
        data: &[u8],
    ) -> Result<(), TransportError>;
}

/// HTTP callback transport: POST the frame to the gateway-management
/// endpoint keyed on connection id.
pub struct HttpCallbackTransport {
    client: reqwest::Client,
}

impl HttpCallbackTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpCallbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayTransport for HttpCallbackTransport {
    async fn post(
        &self,
        connection_id: &str,
        endpoint: &str,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), connection_id);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::GONE {
            Err(TransportError::Gone)
        } else {
            Err(TransportError::Transient(format!(
                "gateway management returned {status}"
            )))
        }
    }
}

/// In-process transport delivering frames straight to registered WebSocket
/// sessions. A missing or closed registration classifies as gone, exactly
/// like the upstream gateway's 410.
#[derive(Default)]
pub struct LocalTransport {
    sessions: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl LocalTransport {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session's outbound channel; returns the receiving half's
    /// counterpart for the caller to hold.
    pub fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(connection_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, connection_id: &str) {
        self.sessions.remove(connection_id);
    }

    pub fn is_registered(&self, connection_id: &str) -> bool {
        self.sessions.contains_key(connection_id)
    }
}

#[async_trait]
impl GatewayTransport for LocalTransport {
    async fn post(
        &self,
        connection_id: &str,
        _endpoint: &str,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let tx = self
            .sessions
            .get(connection_id)
            .ok_or(TransportError::Gone)?;
        let frame = String::from_utf8_lossy(data).into_owned();
        tx.send(frame).map_err(|_| {
            // Receiver dropped: the session is mid-teardown.
            TransportError::Gone
        })
    }
}
