//! Forwarding relayed requests to a local HTTP origin.

use crate::error::Result;
use crate::handler::{LocalHandler, capture_head, record_body};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full};
use relay_common::{ResponseCapture, ResponseSink, strip_hop_by_hop};
use tracing::{debug, warn};
use url::Url;

/// Sends every relayed request on to `origin` and captures its response.
///
/// The relayed path and query are appended to the origin's path. An origin that
/// cannot be reached is answered with `502 Bad Gateway`.
#[derive(Debug, Clone)]
pub struct UpstreamHandler {
    client: reqwest::Client,
    origin: Url,
}

impl UpstreamHandler {
    pub fn new(origin: &str) -> Result<Self> {
        Ok(Self::with_client(reqwest::Client::new(), Url::parse(origin)?))
    }

    pub fn with_client(client: reqwest::Client, origin: Url) -> Self {
        Self { client, origin }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn target(&self, uri: &Uri) -> Url {
        let mut url = self.origin.clone();
        let base = self.origin.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, uri.path()));
        url.set_query(uri.query());
        url
    }

    async fn forward(
        &self,
        request: Request<Full<Bytes>>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let url = self.target(&parts.uri);
        debug!(method = %parts.method, url = %url, "Forwarding to origin");

        self.client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
    }
}

#[async_trait]
impl LocalHandler for UpstreamHandler {
    async fn serve(&self, request: Request<Full<Bytes>>, capture: &mut ResponseCapture) {
        let response = match self.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(origin = %self.origin, "Origin request failed: {}", e);
                capture.write_status(StatusCode::BAD_GATEWAY);
                record_body(capture, format!("origin unreachable: {}", e).as_bytes());
                return;
            }
        };

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        capture_head(capture, status, headers);

        match response.bytes().await {
            Ok(body) => record_body(capture, &body),
            Err(e) => {
                warn!(origin = %self.origin, "Failed to read origin response: {}", e);
                capture.error = Some(format!("failed to read origin response: {}", e));
            }
        }
    }
}
