//! switchboard - a stateless WebSocket request gateway.
//!
//! Clients hold persistent WebSocket connections and submit JSON-framed
//! requests. The router authenticates context, validates the envelope, and
//! dispatches through a typed handler registry: cheap actions run in-line
//! and answer with a `response` frame; expensive ones are durably queued,
//! acknowledged immediately, and executed later by the processor, which
//! streams `progress` frames back to the originating connection.
//!
//! The interesting pieces:
//!
//! - [`router`] - envelope decoding, validation, sync/async dispatch
//! - [`sender`] - resilient per-connection delivery (worker pool, circuit
//!   breaker, retries, stale reaping, broadcast fan-out)
//! - [`processor`] - the deferred execution engine
//! - [`progress`] / [`batcher`] - rate-limited progress streaming
//! - [`store`] - connection / request / subscription records and stores

pub mod auth;
pub mod batcher;
pub mod handler;
pub mod handlers;
pub mod processor;
pub mod progress;
pub mod router;
pub mod sender;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod ws;
