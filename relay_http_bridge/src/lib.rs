//! # Relay HTTP Bridge
//!
//! The public side of an HTTP-over-WebSocket relay.
//!
//! A backend that cannot accept inbound connections dials the relay over a
//! WebSocket and registers under a session name. Ordinary HTTP requests to the
//! relay are then serialised into request envelopes, sent down that WebSocket,
//! answered by the backend and replayed to the original caller.
//!
//! ## Architecture
//!
//! *   **Session Registry**: [`SessionRegistry`] maps names to live sessions. Registering
//!     a name that is already taken replaces (and stops) the older session.
//! *   **Heartbeat**: every session pings its backend on a fixed interval; a missing or
//!     wrong reply stops the session.
//! *   **Request Relay**: [`handle_server`] performs one request/response exchange and
//!     replays the captured response, subject to an optional accept policy.
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_http_bridge::{RelayConfig, start_relay};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig {
//!         bind_addr: "127.0.0.1:3000".parse().unwrap(),
//!         heartbeat_interval_secs: 30,
//!         ..RelayConfig::default()
//!     };
//!
//!     start_relay(config).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod error;
pub mod request_handler;
pub mod session;

pub use bridge::{RelayConfig, relay_router, serve, start_relay, websocket_connection};
pub use error::{BridgeError, Result};
pub use request_handler::{AcceptPolicy, HttpResponseSink, handle_server, max_body_policy};
pub use session::{
    DEFAULT_HEARTBEAT_INTERVAL_SECS, RegistryConfig, Session, SessionRegistry, StopReason,
    heartbeat_interval_secs,
};
