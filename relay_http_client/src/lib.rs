//! # Relay HTTP Client
//!
//! The backend side of an HTTP-over-WebSocket relay.
//!
//! A backend that cannot accept inbound connections dials the relay with
//! [`handle_client`]. The relay registers the connection under a session name and
//! sends every HTTP request addressed to that name down the WebSocket as a request
//! envelope. This crate rebuilds each request, hands it to a [`LocalHandler`] and
//! sends the captured response back.
//!
//! ## Key Features
//!
//! - **Sequential serving**: one request is fully handled before the next is read,
//!   matching the relay's one-request-in-flight-per-session model.
//! - **Heartbeat replies**: relay pings are answered directly, without touching the
//!   local handler.
//! - **Handlers**: [`ServiceHandler`] wraps any tower service (an axum `Router`, for
//!   example); [`UpstreamHandler`] forwards to a local HTTP origin.
//! - **Owned handles**: each call returns its own [`RelayClient`], so one process
//!   can hold any number of sessions.
//!
//! ## Usage
//!
//! ```no_run
//! use relay_http_client::{UpstreamHandler, handle_client};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = UpstreamHandler::new("http://127.0.0.1:8080")?;
//! let client = handle_client(
//!     "ws://relay.example:3000/ws/svc-1",
//!     "http://backend.local",
//!     handler,
//!     None,
//!     None,
//! )
//! .await?;
//!
//! let reason = client.closed().await;
//! println!("session ended: {:?}", reason);
//! # Ok(())
//! # }
//! ```

/// Dialing the relay and the sequential read loop.
pub mod client;
/// Error types for relay client operations.
pub mod error;
/// The local handler contract and the tower adapter.
pub mod handler;
/// Forwarding to a local HTTP origin.
pub mod upstream;

pub use client::{
    ClientClosed, RelayClient, RewritePolicy, handle_client, serve_connection,
    websocket_connection,
};
pub use error::{RelayClientError, Result};
pub use handler::{LocalHandler, ServiceHandler};
pub use upstream::UpstreamHandler;
