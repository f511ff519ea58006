//! Local HTTP handling on the backend side of the tunnel.
//!
//! Every request that arrives through the relay is passed to a [`LocalHandler`]
//! together with a fresh [`ResponseCapture`]. Whatever the handler writes into the
//! capture is sent back to the relay as the response.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use relay_common::{ResponseCapture, ResponseSink};
use std::{fmt::Display, sync::Arc};
use tower::{Service, ServiceExt};
use tracing::{error, warn};

/// Serves one relayed request into a response capture.
///
/// A handler that cannot produce a response should record the reason in
/// [`ResponseCapture::error`] rather than panic.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn serve(&self, request: Request<Full<Bytes>>, response: &mut ResponseCapture);
}

#[async_trait]
impl<H: LocalHandler + ?Sized> LocalHandler for Arc<H> {
    async fn serve(&self, request: Request<Full<Bytes>>, response: &mut ResponseCapture) {
        (**self).serve(request, response).await
    }
}

/// Adapts a tower [`Service`], such as an axum `Router`, into a [`LocalHandler`].
///
/// ```rust
/// use axum::{Router, routing::get};
/// use relay_http_client::ServiceHandler;
///
/// let handler = ServiceHandler::new(Router::<()>::new().route("/hello", get(|| async { "hi" })));
/// ```
#[derive(Debug, Clone)]
pub struct ServiceHandler<S> {
    service: S,
}

impl<S> ServiceHandler<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S, B> LocalHandler for ServiceHandler<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Display,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Display,
{
    async fn serve(&self, request: Request<Full<Bytes>>, capture: &mut ResponseCapture) {
        let response = match self.service.clone().oneshot(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Local service failed: {}", e);
                capture.error = Some(format!("local service failed: {}", e));
                return;
            }
        };

        let (parts, body) = response.into_parts();
        capture_head(capture, parts.status, parts.headers);

        match body.collect().await {
            Ok(collected) => {
                if let Some(trailers) = collected.trailers() {
                    capture.trailer = trailers.clone();
                }
                record_body(capture, &collected.to_bytes());
            }
            Err(e) => {
                warn!("Failed to read local response body: {}", e);
                capture.error = Some(format!("failed to read response body: {}", e));
            }
        }
    }
}

/// Copy status and headers into the capture in writer order.
pub(crate) fn capture_head(
    capture: &mut ResponseCapture,
    status: http::StatusCode,
    headers: http::HeaderMap,
) {
    let target = capture.header();
    for (name, value) in headers.iter() {
        target.append(name.clone(), value.clone());
    }
    capture.write_status(status);
}

pub(crate) fn record_body(capture: &mut ResponseCapture, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    if let Err(e) = capture.write(body) {
        capture.error = Some(format!("failed to record response body: {}", e));
    }
}
