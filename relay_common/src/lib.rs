//! # Relay Common
//!
//! Shared building blocks for tunnelling HTTP over a single persistent message
//! connection (a WebSocket in practice).
//!
//! A backend that cannot accept inbound connections dials a relay node and keeps
//! the connection open. The relay accepts public HTTP, turns each request into a
//! [`RequestEnvelope`], pushes it through the connection, and replays the
//! [`ResponseCapture`] that comes back.
//!
//! ## Modules
//!
//! *   [`envelope`]: lossless JSON representation of an HTTP request.
//! *   [`capture`]: in-memory response writer that doubles as the response envelope.
//! *   [`connection`]: the ordered, reliable message connection both sides talk over.
//! *   [`logging`]: `tracing` subscriber initialisation shared by the binaries.
//!
//! ## Example
//!
//! ```rust
//! use relay_common::{RequestEnvelope, ResponseCapture, ResponseSink};
//! use http::StatusCode;
//!
//! let ping = RequestEnvelope::ping();
//! assert!(ping.is_ping);
//!
//! let mut capture = ResponseCapture::default();
//! capture.header().insert("content-type", "text/plain".parse().unwrap());
//! capture.write_status(StatusCode::OK);
//! capture.write(b"ok").unwrap();
//! assert_eq!(capture.status_code, 200);
//! ```

pub mod capture;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod logging;
mod wire;

pub use capture::{ResponseCapture, ResponseSink};
pub use connection::{Deadlines, Message, MessageConnection, MessageReader, MessageWriter};
pub use envelope::{FormValues, RemoteAddr, RequestEnvelope, RequestMeta, strip_hop_by_hop};
pub use error::{EnvelopeError, TransportError};
