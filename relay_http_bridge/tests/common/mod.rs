//! Shared helpers for relay bridge integration tests.
//!
//! Sessions are registered over in-memory connection pairs, so no sockets are
//! involved. The far end of each pair plays the backend: either a scripted
//! [`spawn_backend`] that answers every envelope, or a raw [`MessageConnection`]
//! driven by the test itself.

// Allow dead_code - these are test utilities, and rustc can't see usage across test crates
#![allow(dead_code)]

use http::{HeaderValue, StatusCode, header};
use relay_common::{MessageConnection, RequestEnvelope, ResponseCapture, ResponseSink};
use relay_http_bridge::{RegistryConfig, Session, SessionRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Upper bound for anything a test waits on.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// A registry whose sessions never ping within a test's lifetime.
pub fn quiet_registry() -> Arc<SessionRegistry> {
    registry_with_heartbeat(Duration::from_secs(3600))
}

pub fn registry_with_heartbeat(interval: Duration) -> Arc<SessionRegistry> {
    relay_common::logging::init_test_logging();
    Arc::new(SessionRegistry::new(RegistryConfig {
        heartbeat_interval: interval,
        ..RegistryConfig::default()
    }))
}

/// Poll `condition` until it holds, panicking after [`WAIT_LIMIT`].
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < WAIT_LIMIT, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A session registered over an in-memory pair.
pub struct Registered {
    /// Backend end of the connection
    pub backend: MessageConnection,
    /// The `start_serve` call; finishes when the session has been torn down
    pub serve: JoinHandle<()>,
    pub session: Arc<Session>,
}

/// Register a new session under `name` and wait until the registry holds it.
pub async fn register(registry: &Arc<SessionRegistry>, name: &str) -> Registered {
    let before = registry.get(name).map(|s| s.id.clone());
    let (relay_end, backend) = MessageConnection::pair();

    let serve = {
        let registry = registry.clone();
        let name = name.to_string();
        tokio::spawn(async move { registry.start_serve(&name, relay_end).await })
    };

    wait_until("session registration", || {
        registry
            .get(name)
            .is_some_and(|s| Some(s.id.clone()) != before)
    })
    .await;

    let session = registry
        .get(name)
        .expect("session should be registered");
    Registered {
        backend,
        serve,
        session,
    }
}

/// Wait for a `start_serve` call to return.
pub async fn finished(serve: JoinHandle<()>) {
    tokio::time::timeout(WAIT_LIMIT, serve)
        .await
        .expect("session did not finish in time")
        .expect("serve task panicked");
}

/// Answer pings with pings and every request with `respond`.
pub fn spawn_backend<F>(mut connection: MessageConnection, respond: F) -> JoinHandle<()>
where
    F: Fn(RequestEnvelope) -> ResponseCapture + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(envelope) = connection.recv_json::<RequestEnvelope>().await {
            let sent = if envelope.is_ping {
                connection.send_json(&RequestEnvelope::ping()).await
            } else {
                connection.send_json(&respond(envelope)).await
            };
            if sent.is_err() {
                break;
            }
        }
    })
}

/// A captured `text/plain` response.
pub fn text_response(status: StatusCode, body: &str) -> ResponseCapture {
    let mut capture = ResponseCapture::default();
    capture
        .header()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    capture.write_status(status);
    capture.write(body.as_bytes()).unwrap();
    capture
}
