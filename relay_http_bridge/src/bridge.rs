//! Relay HTTP server: the public face of the relay.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | Liveness probe |
//! | `GET /ws/{name}` | WebSocket upgrade; the backend registers as session `name` |
//! | `GET /sessions?prefix=` | Session count and whether any name starts with `prefix` |
//! | `DELETE /sessions/{name}` | Stop a session |
//! | `ANY /r/{name}/...` | Relay a request through session `name` |
//!
//! Requests under `/r/{name}` are forwarded with that prefix removed, so a call
//! to `/r/svc/widgets?x=1` reaches the backend as `/widgets?x=1`.

use crate::error::{BridgeError, Result};
use crate::request_handler::{AcceptPolicy, HttpResponseSink, handle_server, max_body_policy};
use crate::session::{RegistryConfig, SessionRegistry, heartbeat_interval_secs};
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, Query, Request, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, delete, get},
};
use futures::{SinkExt, StreamExt, future};
use relay_common::{Message, MessageConnection, RemoteAddr, TransportError};
use serde::Deserialize;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Configuration for the relay server.
///
/// # Example
///
/// ```rust
/// use relay_http_bridge::RelayConfig;
///
/// let config = RelayConfig {
///     bind_addr: "0.0.0.0:8080".parse().unwrap(),
///     max_response_bytes: Some(1 << 20),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Seconds between heartbeat pings on every session.
    pub heartbeat_interval_secs: u64,

    /// Refuse relayed responses with a larger body. The session that produced
    /// such a response is stopped.
    pub max_response_bytes: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            heartbeat_interval_secs: heartbeat_interval_secs(),
            max_response_bytes: None,
        }
    }
}

impl RelayConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            ..RegistryConfig::default()
        }
    }
}

/// Shared state for the relay routes
struct RelayState {
    registry: Arc<SessionRegistry>,
    accept: Option<Arc<AcceptPolicy>>,
}

/// Build the relay router around an existing registry.
pub fn relay_router(registry: Arc<SessionRegistry>, config: &RelayConfig) -> Router {
    let state = Arc::new(RelayState {
        registry,
        accept: config.max_response_bytes.map(max_body_policy),
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/{name}", get(handle_session_upgrade))
        .route("/sessions", get(handle_session_summary))
        .route("/sessions/{name}", delete(handle_session_stop))
        .route("/r/{name}", any(handle_relay))
        .route("/r/{name}/{*rest}", any(handle_relay))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `config.bind_addr` and runs the relay until the server fails.
///
/// # Example
///
/// ```rust,no_run
/// use relay_http_bridge::{RelayConfig, start_relay};
///
/// #[tokio::main]
/// async fn main() {
///     if let Err(e) = start_relay(RelayConfig::default()).await {
///         eprintln!("Relay failed: {}", e);
///     }
/// }
/// ```
pub async fn start_relay(config: RelayConfig) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("Failed to bind: {}", e)))?;
    let registry = Arc::new(SessionRegistry::new(config.registry_config()));
    serve(listener, config, registry).await
}

/// Run the relay on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::HttpServer(format!("Failed to get local addr: {}", e)))?;

    if !local_addr.ip().is_loopback() {
        warn!(
            "Relay bound to non-loopback address {}. Session names are the only access control.",
            local_addr
        );
    }
    info!("Relay listening on http://{}", local_addr);
    info!("Backends register at ws://{}/ws/{{name}}", local_addr);
    info!(
        heartbeat_secs = config.heartbeat_interval_secs,
        max_response_bytes = ?config.max_response_bytes,
        "Relay configuration"
    );

    let app = relay_router(registry, &config);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| BridgeError::HttpServer(format!("Server error: {}", e)))?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Upgrade to a WebSocket and serve it as session `name` until it stops.
async fn handle_session_upgrade(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    info!(session = %name, "Session upgrade requested");
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| async move {
        let connection = websocket_connection(socket).with_peer(format!("ws:{}", name));
        registry.start_serve(&name, connection).await;
    })
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    prefix: Option<String>,
}

/// Report how many sessions are live and, given a prefix, whether any name has it.
async fn handle_session_summary(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    let accepted = query
        .prefix
        .as_deref()
        .map(|prefix| state.registry.is_accepted(prefix));
    Json(serde_json::json!({
        "count": state.registry.count(),
        "accepted": accepted,
    }))
}

/// Stop a session.
///
/// # Returns
///
/// - 204 No Content when a session was signalled
/// - 404 Not Found if no session holds the name
async fn handle_session_stop(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
) -> Response {
    info!(session = %name, "Session stop requested via HTTP DELETE");
    if state.registry.stop_serve(&name) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Relay a request to the backend behind session `name`.
async fn handle_relay(
    State(state): State<Arc<RelayState>>,
    Path(params): Path<HashMap<String, String>>,
    mut request: Request,
) -> Response {
    let Some(name) = params.get("name").cloned() else {
        return (StatusCode::BAD_REQUEST, "Missing session name").into_response();
    };

    match forwarded_uri(request.uri()) {
        Ok(uri) => *request.uri_mut() = uri,
        Err(e) => {
            warn!(session = %name, "Cannot rewrite request uri: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid request uri").into_response();
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>().copied()
    {
        request.extensions_mut().insert(RemoteAddr(addr.to_string()));
    }

    let mut sink = HttpResponseSink::new();
    match handle_server(
        &state.registry,
        &name,
        &mut sink,
        request,
        state.accept.as_deref(),
    )
    .await
    {
        Ok(()) => sink.into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &BridgeError) -> Response {
    let status = match error {
        BridgeError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::Envelope(_) => StatusCode::BAD_REQUEST,
        BridgeError::SessionClosed(_)
        | BridgeError::ResponseRejected(_)
        | BridgeError::Upstream(_)
        | BridgeError::Transport(_)
        | BridgeError::Io(_) => StatusCode::BAD_GATEWAY,
        BridgeError::HttpServer(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(%status, "Relay failed: {}", error);
    (status, error.to_string()).into_response()
}

/// Strip the `/r/{name}` prefix from `uri`, keeping the raw (still encoded) rest
/// of the path and the query.
fn forwarded_uri(uri: &Uri) -> std::result::Result<Uri, axum::http::uri::InvalidUri> {
    let path = uri.path();
    let after = path.strip_prefix("/r/").unwrap_or(path);
    let rest = match after.find('/') {
        Some(index) => &after[index..],
        None => "/",
    };
    match uri.query() {
        Some(query) => format!("{}?{}", rest, query).parse(),
        None => rest.parse(),
    }
}

/// Adapt an axum WebSocket to a [`MessageConnection`].
///
/// WebSocket ping/pong frames are handled by the socket itself and never surface.
pub fn websocket_connection(socket: WebSocket) -> MessageConnection {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::Send(e.to_string()))
        .with(|message: Message| {
            future::ready(Ok::<_, TransportError>(match message {
                Message::Text(text) => WsMessage::Text(text.into()),
                Message::Binary(data) => WsMessage::Binary(data),
            }))
        });

    let stream = stream.filter_map(|frame| {
        future::ready(match frame {
            Ok(WsMessage::Text(text)) => Some(Ok(Message::Text(text.as_str().to_owned()))),
            Ok(WsMessage::Binary(data)) => Some(Ok(Message::Binary(data))),
            Ok(WsMessage::Close(_)) => Some(Err(TransportError::Closed)),
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
        })
    });

    MessageConnection::new(sink, stream)
}
