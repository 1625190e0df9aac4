//! switchproto - Wire protocol types for the switchboard WebSocket gateway
//!
//! This crate defines the JSON frames exchanged between clients and the
//! gateway, the error taxonomy shared by every component, and the `Request`
//! value that flows from the router into handlers and the async queue.
//!
//! Inbound traffic is a single frame shape ([`Envelope`]); outbound traffic
//! is a closed sum ([`Frame`]) tagged by `type`. Routing on the tag string is
//! a serialization detail - everything in-process matches on the enum.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod request;
pub mod retry;

pub use envelope::{Envelope, EnvelopeError, generate_request_id, is_valid_action, MAX_REQUEST_ID_LEN};
pub use error::{ErrorCode, ErrorDetail, RetryHint};
pub use frame::{now_secs, Frame};
pub use request::{Request, RESERVED_METADATA_KEY};
pub use retry::RetryConfig;
