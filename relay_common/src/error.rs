//! Error types shared by both ends of the relay

use std::time::Duration;
use thiserror::Error;

/// Failure to turn an envelope back into something usable.
///
/// These are fatal to the single request being processed, never to the session.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The envelope carried an error recorded when it was built (body read failure).
    #[error("envelope carries error: {0}")]
    Carried(String),

    #[error("invalid method: {0}")]
    Method(String),

    #[error("invalid url: {0}")]
    Url(String),

    #[error("unsupported protocol version: {0}")]
    Protocol(String),

    #[error("invalid status code: {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

/// Failure of the underlying message connection.
///
/// Always fatal to the session that owns the connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("{op} deadline of {after:?} exceeded")]
    Deadline { op: &'static str, after: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
