//! Request routing.
//!
//! `route` decodes the inbound envelope, validates it, builds the
//! `Request` with principal context from the connection record, runs the
//! handler's pre-dispatch validation, and then either executes in-line or
//! enqueues for deferred execution based on the handler's declared cost.
//! A successful route emits exactly one outbound frame on the inbound
//! connection.
//!
//! The registry is assembled once through [`RouterBuilder`] and immutable
//! afterward; middleware registered before a handler wraps it in reverse
//! declaration order, so the first-declared middleware runs outermost.

use crate::handler::{BoxedHandler, Handler};
use crate::sender::{ConnectionManager, SendError};
use crate::store::{AsyncRequestRecord, ConnectionStore, RequestQueue, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchconf::SwitchConfig;
use switchproto::{is_valid_action, Envelope, ErrorCode, ErrorDetail, Frame, Request};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Handler registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid action name {0:?}: must be non-empty and match [A-Za-z0-9._-]+")]
    InvalidAction(String),

    #[error("action already registered: {0}")]
    Duplicate(String),
}

/// Routing failures. Handler and validation errors are reported to the
/// client as frames; only infrastructure faults surface here.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to emit frame: {0}")]
    Send(#[from] SendError),
}

/// A middleware transforms a handler into a wrapped handler. Wrappers must
/// preserve `estimated_duration` and `validate` unless they deliberately
/// alter dispatch cost, and must never swallow handler errors.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler;
}

/// Observability middleware: spans around handler execution, errors logged
/// and passed through untouched.
pub struct LoggingMiddleware;

struct Logged {
    inner: BoxedHandler,
}

#[async_trait::async_trait]
impl Handler for Logged {
    fn estimated_duration(&self) -> Duration {
        self.inner.estimated_duration()
    }

    fn validate(&self, request: &Request) -> Result<(), String> {
        self.inner.validate(request)
    }

    fn supports_progress(&self) -> bool {
        self.inner.supports_progress()
    }

    async fn process(
        &self,
        ctx: &CancellationToken,
        request: &Request,
    ) -> Result<serde_json::Value, crate::handler::HandlerError> {
        let start = Instant::now();
        let result = self.inner.process(ctx, request).await;
        log_outcome(request, start, result.as_ref().err());
        result
    }

    async fn process_with_progress(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        reporter: &crate::progress::ProgressReporter,
    ) -> Result<serde_json::Value, crate::handler::HandlerError> {
        let start = Instant::now();
        let result = self.inner.process_with_progress(ctx, request, reporter).await;
        log_outcome(request, start, result.as_ref().err());
        result
    }
}

fn log_outcome(request: &Request, start: Instant, error: Option<&crate::handler::HandlerError>) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match error {
        None => tracing::info!(
            action = %request.action,
            request_id = %request.id,
            elapsed_ms,
            "handler completed"
        ),
        Some(e) => tracing::warn!(
            action = %request.action,
            request_id = %request.id,
            elapsed_ms,
            error = %e,
            "handler failed"
        ),
    }
}

impl Middleware for LoggingMiddleware {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Logged { inner: next })
    }
}

/// Dispatch tunables.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub async_threshold: Duration,
    pub payload_max_bytes: usize,
    pub request_ttl: Duration,
}

impl From<&SwitchConfig> for RouterOptions {
    fn from(config: &SwitchConfig) -> Self {
        Self {
            async_threshold: config.router.async_threshold(),
            payload_max_bytes: config.router.payload_max_bytes,
            request_ttl: config.ttl.request_ttl(),
        }
    }
}

/// Write-once registry assembly.
#[derive(Default)]
pub struct RouterBuilder {
    handlers: HashMap<String, BoxedHandler>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterBuilder")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("middleware_count", &self.middleware.len())
            .finish()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware. Only handlers registered afterwards are
    /// wrapped by it.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Register a handler for an action. Actions are unique and must
    /// satisfy the action-name grammar.
    pub fn handle(
        mut self,
        action: &str,
        handler: impl Handler + 'static,
    ) -> Result<Self, RegistryError> {
        if !is_valid_action(action) {
            return Err(RegistryError::InvalidAction(action.to_string()));
        }
        if self.handlers.contains_key(action) {
            return Err(RegistryError::Duplicate(action.to_string()));
        }

        // First-declared middleware wraps outermost.
        let mut wrapped: BoxedHandler = Arc::new(handler);
        for middleware in self.middleware.iter().rev() {
            wrapped = middleware.wrap(wrapped);
        }
        self.handlers.insert(action.to_string(), wrapped);
        Ok(self)
    }

    pub fn build(
        self,
        connections: Arc<dyn ConnectionStore>,
        queue: Arc<dyn RequestQueue>,
        sender: Arc<ConnectionManager>,
        options: RouterOptions,
    ) -> Router {
        Router {
            handlers: Arc::new(self.handlers),
            connections,
            queue,
            sender,
            options,
        }
    }
}

/// The router. Immutable after construction; invoked concurrently.
pub struct Router {
    handlers: Arc<HashMap<String, BoxedHandler>>,
    connections: Arc<dyn ConnectionStore>,
    queue: Arc<dyn RequestQueue>,
    sender: Arc<ConnectionManager>,
    options: RouterOptions,
}

impl Router {
    /// The frozen registry, shared with the processor.
    pub fn handlers(&self) -> Arc<HashMap<String, BoxedHandler>> {
        Arc::clone(&self.handlers)
    }

    /// Route one inbound frame and emit exactly one outbound frame.
    pub async fn route(
        &self,
        ctx: &CancellationToken,
        raw: &[u8],
        connection_id: &str,
    ) -> Result<(), RouteError> {
        let frame = self.dispatch(ctx, raw, connection_id).await;
        self.sender.send(connection_id, &frame).await?;
        Ok(())
    }

    /// The normative dispatch order, producing the single frame to emit.
    async fn dispatch(&self, ctx: &CancellationToken, raw: &[u8], connection_id: &str) -> Frame {
        // Payload ceiling first; an oversized frame is not worth parsing.
        if raw.len() > self.options.payload_max_bytes {
            return Frame::error(
                None,
                ErrorDetail::validation("payload exceeds size ceiling").with_details(
                    serde_json::json!({
                        "reason": "payload_too_large",
                        "max": self.options.payload_max_bytes,
                    }),
                ),
            );
        }

        // 1. Parse and validate the envelope.
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Frame::error(
                    None,
                    ErrorDetail::validation(e.to_string()).with_details(e.details()),
                );
            }
        };
        if let Err(e) = envelope.validate() {
            return Frame::error(
                envelope.id.clone(),
                ErrorDetail::validation(e.to_string()).with_details(e.details()),
            );
        }

        // 2. Handler lookup.
        let action = envelope.action.as_deref().unwrap_or_default();
        let Some(handler) = self.handlers.get(action) else {
            return Frame::error(
                Some(envelope.request_id()),
                ErrorDetail::invalid_action(action),
            );
        };

        // 3. Build the request with principal context from the connection.
        let (user_id, tenant_id) = match self.connections.get(connection_id).await {
            Ok(record) => (Some(record.user_id), Some(record.tenant_id)),
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(connection_id, "routing for unknown connection");
                (None, None)
            }
            Err(e) => {
                return Frame::error(
                    Some(envelope.request_id()),
                    ErrorDetail::storage(e.to_string()),
                );
            }
        };
        let request = Request::from_envelope(&envelope, connection_id, user_id, tenant_id);

        // 4. Handler pre-dispatch validation.
        if let Err(message) = handler.validate(&request) {
            return Frame::error(Some(request.id), ErrorDetail::validation(message));
        }

        // 5-7. Sync/async decision.
        if handler.estimated_duration() > self.options.async_threshold {
            self.enqueue(request).await
        } else {
            match handler.process(ctx, &request).await {
                Ok(data) => Frame::response(request.id, data),
                Err(e) => Frame::response_error(request.id, e.to_detail()),
            }
        }
    }

    async fn enqueue(&self, request: Request) -> Frame {
        let record = AsyncRequestRecord::from_request(&request, self.options.request_ttl);
        match self.queue.enqueue(record).await {
            Ok(()) => Frame::acknowledgment(
                request.id,
                Some("queued for deferred execution".to_string()),
            ),
            Err(StoreError::Conflict { .. }) => Frame::error(
                Some(request.id),
                ErrorDetail::new(
                    ErrorCode::DuplicateRequest,
                    "request id already submitted",
                ),
            ),
            Err(e) => {
                tracing::error!(request_id = %request.id, error = %e, "enqueue failed");
                Frame::error(Some(request.id), ErrorDetail::storage(e.to_string()))
            }
        }
    }
}
