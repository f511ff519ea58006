//! Relaying one inbound HTTP request through a named session.

use crate::error::{BridgeError, Result};
use crate::session::{SessionRegistry, StopReason};
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::BytesMut;
use http_body::Body as HttpBody;
use relay_common::{
    EnvelopeError, RequestEnvelope, ResponseCapture, ResponseSink, strip_hop_by_hop,
};
use std::{fmt::Display, io, sync::Arc};
use tracing::{debug, error, info, warn};

/// Decides whether a captured response may be written back to the caller.
///
/// A rejected response is discarded and its session is stopped.
pub type AcceptPolicy = dyn Fn(&ResponseCapture) -> bool + Send + Sync;

/// Build an accept policy that refuses bodies larger than `limit` bytes.
pub fn max_body_policy(limit: usize) -> Arc<AcceptPolicy> {
    Arc::new(move |capture: &ResponseCapture| capture.body.len() <= limit)
}

/// Relay `request` through the session registered as `name` and replay the
/// backend's response into `sink`.
///
/// Nothing is written to `sink` unless the whole exchange succeeds.
///
/// # Errors
///
/// - [`BridgeError::SessionNotFound`] when no session holds `name`.
/// - [`BridgeError::Envelope`] when the request body could not be read.
/// - [`BridgeError::SessionClosed`] when the session stopped or the connection
///   failed mid-exchange. The session is stopped.
/// - [`BridgeError::Upstream`] when the backend reported its own failure.
/// - [`BridgeError::ResponseRejected`] when `accept` refused the response. The
///   session is stopped.
pub async fn handle_server<B, S>(
    registry: &SessionRegistry,
    name: &str,
    sink: &mut S,
    request: http::Request<B>,
    accept: Option<&AcceptPolicy>,
) -> Result<()>
where
    B: HttpBody,
    B::Error: Display,
    S: ResponseSink + ?Sized,
{
    let Some(session) = registry.get(name) else {
        warn!(session = %name, "No session registered under this name");
        return Err(BridgeError::SessionNotFound(name.to_string()));
    };

    let envelope = RequestEnvelope::from_request(request).await;
    if let Some(error) = envelope.error {
        warn!(session = %name, "Failed to read request body: {}", error);
        return Err(EnvelopeError::Carried(error).into());
    }

    debug!(
        session = %name,
        method = %envelope.method,
        url = %envelope.url,
        bytes = envelope.body.len(),
        "Relaying request"
    );

    let capture = match session.round_trip(envelope).await {
        Ok(capture) => capture,
        Err(e) => {
            error!(session = %name, "Request relay failed: {}", e);
            session.stop(StopReason::TransportFailed);
            return Err(e);
        }
    };

    if let Some(error) = capture.error {
        warn!(session = %name, "Backend failed to handle request: {}", error);
        return Err(BridgeError::Upstream(error));
    }

    if let Some(accept) = accept
        && !accept(&capture)
    {
        warn!(
            session = %name,
            status = capture.status_code,
            bytes = capture.body.len(),
            "Response refused by accept policy"
        );
        session.stop(StopReason::ResponseRejected);
        return Err(BridgeError::ResponseRejected(name.to_string()));
    }

    capture.replay(sink)?;
    info!(
        session = %name,
        status = capture.status_code,
        bytes = capture.body.len(),
        "Relayed response"
    );
    Ok(())
}

/// Buffers a replayed response and turns it into an axum [`Response`].
///
/// Follows the usual writer rules: headers are only honoured until the status is
/// written, the first status wins, and writing body bytes without a status
/// implies `200 OK`.
#[derive(Debug, Default)]
pub struct HttpResponseSink {
    headers: HeaderMap,
    /// Scratch map handed out once the status is written
    detached: HeaderMap,
    status: Option<StatusCode>,
    body: BytesMut,
}

impl HttpResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status written so far, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when nothing at all has been written.
    pub fn is_untouched(&self) -> bool {
        self.status.is_none() && self.headers.is_empty() && self.body.is_empty()
    }

    pub fn into_response(mut self) -> Response {
        strip_hop_by_hop(&mut self.headers);
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseSink for HttpResponseSink {
    fn header(&mut self) -> &mut HeaderMap {
        if self.status.is_some() {
            self.detached.clear();
            return &mut self.detached;
        }
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        match self.status {
            Some(existing) => {
                debug!(%existing, ignored = %status, "Status already written");
            }
            None => self.status = Some(status),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(data);
        Ok(data.len())
    }
}
