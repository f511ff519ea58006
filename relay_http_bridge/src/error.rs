//! Error types for the relay bridge

use relay_common::{EnvelopeError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Response rejected by accept policy for session {0}")]
    ResponseRejected(String),

    #[error("Backend reported error: {0}")]
    Upstream(String),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP server error: {0}")]
    HttpServer(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
