//! Backend side of the relay: dial out, then serve relayed requests locally.

use crate::error::{RelayClientError, Result};
use crate::handler::LocalHandler;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, future};
use http::{HeaderValue, Request, header};
use http_body_util::Full;
use relay_common::{Message, MessageConnection, RequestEnvelope, ResponseCapture, TransportError};
use std::sync::Arc;
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message as WsMessage, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Adjusts each relayed request before it reaches the local handler, for example
/// to rewrite its path.
pub type RewritePolicy = Arc<dyn Fn(&mut Request<Full<Bytes>>) + Send + Sync>;

/// Why a relay client stopped serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientClosed {
    /// [`RelayClient::shutdown`] was called
    Shutdown,
    /// Receiving or sending on the relay connection failed
    ConnectionLost(String),
}

/// Handle to one outbound relay session.
///
/// Dropping the handle leaves the session running; call [`RelayClient::shutdown`]
/// to end it.
pub struct RelayClient {
    shutdown: CancellationToken,
    task: JoinHandle<ClientClosed>,
}

impl RelayClient {
    /// Start serving `connection` in the background.
    pub fn spawn<H>(
        connection: MessageConnection,
        handler: H,
        closed: Option<oneshot::Sender<ClientClosed>>,
        rewrite: Option<RewritePolicy>,
    ) -> Self
    where
        H: LocalHandler + 'static,
    {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            connection,
            handler,
            closed,
            rewrite,
            shutdown.clone(),
        ));
        Self { shutdown, task }
    }

    /// Stop reading, close the connection and end the session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end.
    pub async fn closed(self) -> ClientClosed {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) => {
                error!("Relay client task failed: {}", e);
                ClientClosed::ConnectionLost(format!("client task failed: {}", e))
            }
        }
    }
}

/// Dial `relay_url`, announcing `origin`, and serve relayed requests with `handler`.
///
/// The relay registers the connection under the session name carried in the URL
/// (`ws://relay/ws/{name}`). When the session ends its reason is also sent on
/// `closed`, if given.
///
/// # Errors
///
/// Fails if `origin` is not a valid header value or the WebSocket handshake fails.
pub async fn handle_client<H>(
    relay_url: &str,
    origin: &str,
    handler: H,
    closed: Option<oneshot::Sender<ClientClosed>>,
    rewrite: Option<RewritePolicy>,
) -> Result<RelayClient>
where
    H: LocalHandler + 'static,
{
    let mut request = relay_url.into_client_request()?;
    let origin_value = HeaderValue::from_str(origin)
        .map_err(|_| RelayClientError::InvalidOrigin(origin.to_string()))?;
    request.headers_mut().insert(header::ORIGIN, origin_value);

    info!(relay = %relay_url, origin = %origin, "Connecting to relay");
    let (socket, response) = connect_async(request).await.map_err(|e| {
        error!(relay = %relay_url, "Relay connection failed: {}", e);
        RelayClientError::from(e)
    })?;
    debug!(status = %response.status(), "Relay accepted the session");

    let connection = websocket_connection(socket).with_peer(relay_url);
    Ok(RelayClient::spawn(connection, handler, closed, rewrite))
}

/// Serve relayed requests on an already open connection until it fails.
///
/// Requests are handled strictly one at a time. The connection is closed before
/// this returns.
pub async fn serve_connection<H>(
    connection: MessageConnection,
    handler: H,
    closed: Option<oneshot::Sender<ClientClosed>>,
    rewrite: Option<RewritePolicy>,
) -> ClientClosed
where
    H: LocalHandler,
{
    run(connection, handler, closed, rewrite, CancellationToken::new()).await
}

async fn run<H>(
    mut connection: MessageConnection,
    handler: H,
    closed: Option<oneshot::Sender<ClientClosed>>,
    rewrite: Option<RewritePolicy>,
    shutdown: CancellationToken,
) -> ClientClosed
where
    H: LocalHandler,
{
    let reason = tokio::select! {
        reason = read_loop(&mut connection, &handler, rewrite.as_ref()) => reason,
        _ = shutdown.cancelled() => ClientClosed::Shutdown,
    };

    if let Err(e) = connection.close().await {
        debug!("Error closing relay connection: {}", e);
    }
    info!(peer = %connection.peer(), reason = ?reason, "Relay client closed");

    if let Some(closed) = closed {
        let _ = closed.send(reason.clone());
    }
    reason
}

async fn read_loop<H>(
    connection: &mut MessageConnection,
    handler: &H,
    rewrite: Option<&RewritePolicy>,
) -> ClientClosed
where
    H: LocalHandler + ?Sized,
{
    loop {
        let envelope: RequestEnvelope = match connection.recv_json().await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(peer = %connection.peer(), "Failed to receive from relay: {}", e);
                return ClientClosed::ConnectionLost(e.to_string());
            }
        };

        if envelope.is_ping {
            debug!("Ping from relay");
            if let Err(e) = connection.send_json(&RequestEnvelope::ping()).await {
                error!("Failed to answer ping: {}", e);
                return ClientClosed::ConnectionLost(e.to_string());
            }
            continue;
        }

        let served = envelope.without_body();
        let mut request = match envelope.into_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping request that cannot be rebuilt: {}", e);
                continue;
            }
        };

        if let Some(rewrite) = rewrite {
            rewrite(&mut request);
        }

        let method = request.method().clone();
        let uri = request.uri().clone();
        let version = request.version();

        let mut capture = ResponseCapture::default();
        handler.serve(request, &mut capture).await;
        capture.finish(version);
        capture.request_envelope = Some(Box::new(served));

        debug!(
            method = %method,
            uri = %uri,
            status = capture.status_code,
            bytes = capture.body.len(),
            "Handled relayed request"
        );

        if let Err(e) = connection.send_json(&capture).await {
            error!("Failed to send response to relay: {}", e);
            return ClientClosed::ConnectionLost(e.to_string());
        }
    }
}

/// Adapt a client WebSocket to a [`MessageConnection`].
pub fn websocket_connection(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> MessageConnection {
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
