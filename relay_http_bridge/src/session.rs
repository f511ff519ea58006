//! Named relay sessions.
//!
//! A backend that cannot accept inbound connections dials the relay and registers
//! a message connection under a name. [`SessionRegistry::start_serve`] owns that
//! connection for its whole lifetime: it installs the [`Session`], starts the
//! session's pump task and blocks until the session is told to stop.
//!
//! ## Lifecycle
//!
//! 1. **Register**: a new [`Session`] is built and inserted under its name. If a
//!    session already holds the name it is stopped with [`StopReason::Replaced`];
//!    the new session does not wait for the old one to finish tearing down.
//! 2. **Serve**: the pump task is the only code that touches the connection. It
//!    writes queued request envelopes, sends a ping on every heartbeat tick, and
//!    reads every inbound message, routing pongs to the heartbeat check and
//!    responses to whoever is waiting for them.
//! 3. **Stop**: the stop signal is a single-shot [`CancellationToken`]. It fires on
//!    an explicit [`SessionRegistry::stop_serve`], heartbeat failure, transport
//!    failure, protocol violation, accept-policy rejection or replacement. Firing
//!    it again is a no-op and the first reason is kept.
//! 4. **Teardown**: the registry entry is removed (only if it still points at this
//!    session), the active count is decremented and the connection is closed.
//!
//! ## Ordering
//!
//! The peer answers strictly in order, so inbound messages are matched against a
//! FIFO of what the pump has sent: a pong for each ping, a response for each
//! request. A ping reply that is not a ping, or a message nobody is waiting for,
//! stops the session.
//!
//! Requests on one session are also serialised by [`Session::round_trip`], so at
//! most one request is in flight per session and overlapping callers queue.

use crate::error::{BridgeError, Result};
use dashmap::DashMap;
use relay_common::{
    Deadlines, Message, MessageConnection, MessageReader, MessageWriter, RequestEnvelope,
    ResponseCapture, TransportError,
};
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Queue depth for outbound requests. Only one is in flight at a time.
const OUTBOUND_CAPACITY: usize = 8;

/// How long teardown waits for the connection's close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Get the heartbeat interval in seconds from RELAY_HEARTBEAT_INTERVAL_SECS env var.
/// Defaults to 60 seconds if not set, zero or invalid.
pub fn heartbeat_interval_secs() -> u64 {
    std::env::var("RELAY_HEARTBEAT_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS)
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop_serve` was called for the session's name
    Requested,
    /// A newer session registered under the same name
    Replaced,
    /// A ping could not be sent, or its reply was missing or not a ping
    HeartbeatFailed,
    /// Sending or receiving on the connection failed
    TransportFailed,
    /// The peer sent something the session was not waiting for
    ProtocolViolation,
    /// The accept policy refused a response
    ResponseRejected,
}

/// A request waiting to be written, with the slot its response goes to.
struct PendingRequest {
    envelope: RequestEnvelope,
    reply: oneshot::Sender<ResponseCapture>,
}

/// What the pump expects the next inbound message to be.
enum Expected {
    Pong,
    Response(oneshot::Sender<ResponseCapture>),
}

/// One registered tunnel.
pub struct Session {
    /// Unique per registration, so a replaced session can be told apart in logs
    pub id: String,
    /// Registry key and routing token
    pub name: String,
    outbound: mpsc::Sender<PendingRequest>,
    stop: CancellationToken,
    stop_reason: OnceLock<StopReason>,
    /// Held for the duration of a request/response exchange
    in_flight: Mutex<()>,
    created_at: Instant,
}

impl Session {
    fn new(name: &str, outbound: mpsc::Sender<PendingRequest>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            outbound,
            stop: CancellationToken::new(),
            stop_reason: OnceLock::new(),
            in_flight: Mutex::new(()),
            created_at: Instant::now(),
        }
    }

    /// Fire the stop signal. Safe to call any number of times.
    pub fn stop(&self, reason: StopReason) {
        if self.stop_reason.set(reason).is_ok() {
            info!(
                session = %self.name,
                session_id = %self.id,
                reason = ?reason,
                "Stopping session"
            );
        }
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// The reason the session was first told to stop.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason.get().copied()
    }

    /// Resolves once the stop signal has fired.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Send a request envelope and wait for the matching response.
    ///
    /// Calls on the same session queue behind each other.
    pub async fn round_trip(&self, envelope: RequestEnvelope) -> Result<ResponseCapture> {
        let _turn = self.in_flight.lock().await;
        if self.is_stopped() {
            return Err(BridgeError::SessionClosed(self.name.clone()));
        }

        let (reply, response) = oneshot::channel();
        self.outbound
            .send(PendingRequest { envelope, reply })
            .await
            .map_err(|_| BridgeError::SessionClosed(self.name.clone()))?;

        tokio::select! {
            biased;
            result = response => {
                result.map_err(|_| BridgeError::SessionClosed(self.name.clone()))
            }
            _ = self.stop.cancelled() => Err(BridgeError::SessionClosed(self.name.clone())),
        }
    }
}

/// Configuration for the `SessionRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between pings. A ping must be answered before the next tick.
    pub heartbeat_interval: Duration,
    /// Deadlines applied to every registered connection.
    pub deadlines: Deadlines,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs()),
            deadlines: Deadlines::default(),
        }
    }
}

/// Maps session names to live sessions.
///
/// Constructed once by the process entry point and shared by reference; tests can
/// run any number of independent registries.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    active: AtomicUsize,
    config: RegistryConfig,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            config,
        }
    }

    /// Register `connection` under `name` and serve it until the session stops.
    ///
    /// This call is the session's lifetime. It returns after the registry entry is
    /// removed and the connection is closed.
    pub async fn start_serve(&self, name: &str, mut connection: MessageConnection) {
        connection.set_deadlines(self.config.deadlines);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = Arc::new(Session::new(name, outbound_tx));

        // Counted before it becomes visible, so a registered name is always counted.
        self.active.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = self.sessions.insert(name.to_string(), session.clone()) {
            info!(
                session = %name,
                previous_id = %previous.id,
                "Replacing existing session"
            );
            previous.stop(StopReason::Replaced);
        }

        info!(
            session = %name,
            session_id = %session.id,
            peer = %connection.peer(),
            active = self.count(),
            "Session registered"
        );

        let mut pump: JoinHandle<()> = tokio::spawn(pump(
            session.clone(),
            connection,
            outbound_rx,
            self.config.heartbeat_interval,
        ));

        let finished = tokio::select! {
            _ = session.stopped() => None,
            result = &mut pump => Some(result),
        };
        if let Some(Err(e)) = &finished {
            error!(session = %name, session_id = %session.id, "Session pump failed: {}", e);
        }
        // The pump always fires the stop signal on exit; this covers a panic.
        session.stop(StopReason::TransportFailed);

        self.sessions
            .remove_if(name, |_, current| Arc::ptr_eq(current, &session));
        self.active.fetch_sub(1, Ordering::SeqCst);

        if finished.is_none()
            && let Err(e) = pump.await
        {
            error!(session = %name, session_id = %session.id, "Session pump failed: {}", e);
        }

        info!(
            session = %name,
            session_id = %session.id,
            reason = ?session.stop_reason(),
            uptime_ms = session.uptime().as_millis() as u64,
            active = self.count(),
            "Session ended"
        );
    }

    /// Signal the session registered under `name` to stop.
    ///
    /// Returns whether a session was found; an unknown name is not an error.
    pub fn stop_serve(&self, name: &str) -> bool {
        match self.get(name) {
            Some(session) => {
                session.stop(StopReason::Requested);
                true
            }
            None => {
                debug!(session = %name, "Stop requested for unknown session");
                false
            }
        }
    }

    /// Number of sessions currently registered.
    pub fn count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether any registered name starts with `prefix`.
    pub fn is_accepted(&self, prefix: &str) -> bool {
        self.sessions.iter().any(|entry| entry.key().starts_with(prefix))
    }

    /// Look up a live session by name.
    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).map(|s| s.clone())
    }
}

/// The session's single reader and writer.
async fn pump(
    session: Arc<Session>,
    connection: MessageConnection,
    mut outbound: mpsc::Receiver<PendingRequest>,
    heartbeat: Duration,
) {
    let (mut writer, mut reader) = connection.split();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut expected: VecDeque<Expected> = VecDeque::new();

    let failure = loop {
        tokio::select! {
            _ = session.stop.cancelled() => break None,

            _ = ticker.tick() => {
                if expected.iter().any(|e| matches!(e, Expected::Pong)) {
                    warn!(session = %session.name, "No ping reply before the next heartbeat");
                    break Some(StopReason::HeartbeatFailed);
                }
                debug!(session = %session.name, "Sending ping");
                if let Err(e) = send(&session, &mut writer, &RequestEnvelope::ping()).await {
                    error!(session = %session.name, "Failed to send ping: {}", e);
                    break Some(StopReason::HeartbeatFailed);
                }
                expected.push_back(Expected::Pong);
            }

            Some(request) = outbound.recv() => {
                if let Err(e) = send(&session, &mut writer, &request.envelope).await {
                    error!(session = %session.name, "Failed to send request: {}", e);
                    break Some(StopReason::TransportFailed);
                }
                debug!(
                    session = %session.name,
                    method = %request.envelope.method,
                    url = %request.envelope.url,
                    "Sent request to peer"
                );
                expected.push_back(Expected::Response(request.reply));
            }

            inbound = reader.recv() => {
                let message = match inbound {
                    Ok(message) => message,
                    Err(TransportError::Closed) => {
                        info!(session = %session.name, "Peer closed the connection");
                        break Some(StopReason::TransportFailed);
                    }
                    Err(e) => {
                        error!(session = %session.name, "Failed to receive: {}", e);
                        break Some(StopReason::TransportFailed);
                    }
                };
                if let Err(reason) = deliver(&session.name, &mut expected, message) {
                    break Some(reason);
                }
            }
        }
    };

    if let Some(reason) = failure {
        session.stop(reason);
    }

    // Dropping the reply slots wakes every waiting requester with an error.
    expected.clear();
    outbound.close();
    close(&session, writer, reader).await;
}

/// Write one envelope, giving up as soon as the session is told to stop.
async fn send(
    session: &Session,
    writer: &mut MessageWriter,
    envelope: &RequestEnvelope,
) -> std::result::Result<(), TransportError> {
    tokio::select! {
        result = writer.send_json(envelope) => result,
        _ = session.stop.cancelled() => Err(TransportError::Closed),
    }
}

async fn close(session: &Session, mut writer: MessageWriter, reader: MessageReader) {
    match tokio::time::timeout(CLOSE_GRACE, writer.close()).await {
        Ok(Ok(())) => debug!(session = %session.name, "Connection closed"),
        Ok(Err(e)) => warn!(session = %session.name, "Error closing connection: {}", e),
        Err(_) => warn!(session = %session.name, "Timed out closing connection"),
    }
    drop(reader);
}

/// Match an inbound message against the head of the expectation queue.
fn deliver(
    name: &str,
    expected: &mut VecDeque<Expected>,
    message: Message,
) -> std::result::Result<(), StopReason> {
    let value: Value = serde_json::from_slice(message.as_bytes()).map_err(|e| {
        warn!(session = %name, "Undecodable message from peer: {}", e);
        StopReason::ProtocolViolation
    })?;
    let is_ping = value
        .get("isPing")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    match (expected.pop_front(), is_ping) {
        (Some(Expected::Pong), true) => {
            debug!(session = %name, "Pong received");
            Ok(())
        }
        (Some(Expected::Pong), false) => {
            warn!(session = %name, "Expected a ping reply, got something else");
            Err(StopReason::HeartbeatFailed)
        }
        (Some(Expected::Response(reply)), false) => {
            let capture: ResponseCapture = serde_json::from_value(value).map_err(|e| {
                warn!(session = %name, "Malformed response envelope: {}", e);
                StopReason::ProtocolViolation
            })?;
            debug!(
                session = %name,
                status = capture.status_code,
                bytes = capture.body.len(),
                "Received response from peer"
            );
            if reply.send(capture).is_err() {
                debug!(session = %name, "Requester went away; response dropped");
            }
            Ok(())
        }
        (Some(Expected::Response(_)), true) => {
            warn!(session = %name, "Ping arrived while a response was expected");
            Err(StopReason::ProtocolViolation)
        }
        (None, _) => {
            warn!(session = %name, "Unsolicited message from peer");
            Err(StopReason::ProtocolViolation)
        }
    }
}
