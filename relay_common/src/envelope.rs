//! Request envelope: the JSON form of an HTTP request carried across the tunnel.
//!
//! Building an envelope buffers the whole body. A body read failure does not abort
//! the conversion; it is stored in [`RequestEnvelope::error`] and only surfaces when
//! the envelope is turned back into a request with [`RequestEnvelope::into_request`].
//!
//! Fields `http::Request` has no slot for (host, form values, trailers, remote
//! address, raw request-URI, close flag, content length, transfer encodings) travel
//! through the [`RequestMeta`] request extension, so converting back and forth is
//! lossless.

use crate::error::EnvelopeError;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri, Version, header};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Parsed form values, query and url-encoded body combined.
pub type FormValues = BTreeMap<String, Vec<String>>;

/// Peer address of the original caller, inserted as a request extension by the
/// HTTP layer that accepted the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Request attributes that have no home on `http::Request`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMeta {
    pub content_length: i64,
    pub transfer_encoding: Vec<String>,
    pub close: bool,
    pub host: String,
    pub form: FormValues,
    pub trailer: HeaderMap,
    pub remote_addr: String,
    pub request_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub method: String,
    pub url: String,
    pub protocol: String,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    #[serde(with = "crate::wire::header_multimap")]
    pub headers: HeaderMap,
    #[serde(with = "crate::wire::base64_bytes")]
    pub body: Bytes,
    pub content_length: i64,
    pub transfer_encoding: Vec<String>,
    pub close: bool,
    pub host: String,
    pub form: FormValues,
    #[serde(with = "crate::wire::header_multimap")]
    pub trailer: HeaderMap,
    pub remote_addr: String,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub error: Option<String>,
    pub is_ping: bool,
}

impl RequestEnvelope {
    /// Heartbeat envelope. Carries nothing but the ping flag.
    pub fn ping() -> Self {
        Self {
            is_ping: true,
            ..Self::default()
        }
    }

    /// Copy of this envelope without its body, for embedding in a response.
    pub fn without_body(&self) -> Self {
        Self {
            body: Bytes::new(),
            ..self.clone()
        }
    }

    /// Buffer `request` into an envelope.
    ///
    /// The body is read to the end and dropped. If reading fails the error is
    /// recorded on the envelope instead of being returned.
    pub async fn from_request<B>(request: Request<B>) -> Self
    where
        B: Body,
        B::Error: Display,
    {
        let (parts, body) = request.into_parts();

        let (body, body_trailers, error) = match body.collect().await {
            Ok(collected) => {
                let trailers = collected.trailers().cloned();
                (collected.to_bytes(), trailers, None)
            }
            Err(e) => (Bytes::new(), None, Some(e.to_string())),
        };

        let (protocol, protocol_major, protocol_minor) = version_parts(parts.version);

        let meta = match parts.extensions.get::<RequestMeta>() {
            Some(meta) => meta.clone(),
            None => derive_meta(&parts, &body, body_trailers),
        };

        Self {
            method: parts.method.to_string(),
            url: parts.uri.to_string(),
            protocol: protocol.to_string(),
            protocol_major,
            protocol_minor,
            headers: parts.headers,
            body,
            content_length: meta.content_length,
            transfer_encoding: meta.transfer_encoding,
            close: meta.close,
            host: meta.host,
            form: meta.form,
            trailer: meta.trailer,
            remote_addr: meta.remote_addr,
            request_uri: meta.request_uri,
            error,
            is_ping: false,
        }
    }

    /// Rebuild a request with a replayable body.
    ///
    /// Fails with the carried error if the envelope has one, or when the method,
    /// url or protocol version cannot be parsed.
    pub fn into_request(self) -> Result<Request<Full<Bytes>>, EnvelopeError> {
        if let Some(error) = self.error {
            return Err(EnvelopeError::Carried(error));
        }

        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| EnvelopeError::Method(self.method.clone()))?;
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| EnvelopeError::Url(format!("{}: {}", self.url, e)))?;
        let version = parse_version(&self.protocol, self.protocol_major, self.protocol_minor)?;

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .version(version)
            .body(Full::new(self.body))?;

        *request.headers_mut() = self.headers;
        request.extensions_mut().insert(RemoteAddr(self.remote_addr.clone()));
        request.extensions_mut().insert(RequestMeta {
            content_length: self.content_length,
            transfer_encoding: self.transfer_encoding,
            close: self.close,
            host: self.host,
            form: self.form,
            trailer: self.trailer,
            remote_addr: self.remote_addr,
            request_uri: self.request_uri,
        });

        Ok(request)
    }
}

fn derive_meta(parts: &http::request::Parts, body: &Bytes, trailers: Option<HeaderMap>) -> RequestMeta {
    let transfer_encoding: Vec<String> = parts
        .headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let content_length = match parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        Some(length) => length,
        None if !transfer_encoding.is_empty() => -1,
        None => body.len() as i64,
    };

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let remote_addr = parts
        .extensions
        .get::<RemoteAddr>()
        .map(|a| a.0.clone())
        .unwrap_or_default();

    RequestMeta {
        content_length,
        transfer_encoding,
        close: wants_close(parts),
        host,
        form: parse_form(parts, body),
        trailer: trailers.unwrap_or_default(),
        remote_addr,
        request_uri,
    }
}

fn wants_close(parts: &http::request::Parts) -> bool {
    let connection = parts
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();

    if connection.iter().any(|v| v == "close") {
        return true;
    }
    parts.version == Version::HTTP_10 && !connection.iter().any(|v| v == "keep-alive")
}

/// Url-encoded body values first, then query values, appended per key.
fn parse_form(parts: &http::request::Parts, body: &Bytes) -> FormValues {
    let mut form = FormValues::new();

    let is_urlencoded = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_urlencoded {
        for (key, value) in url::form_urlencoded::parse(body) {
            form.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    if let Some(query) = parts.uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            form.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    form
}

fn version_parts(version: Version) -> (&'static str, u8, u8) {
    match version {
        Version::HTTP_09 => ("HTTP/0.9", 0, 9),
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        Version::HTTP_3 => ("HTTP/3.0", 3, 0),
        _ => ("HTTP/1.1", 1, 1),
    }
}

/// Envelopes with no protocol at all (hand-written or from older peers) are HTTP/1.1.
pub(crate) fn parse_version(protocol: &str, major: u8, minor: u8) -> Result<Version, EnvelopeError> {
    match (major, minor) {
        (0, 0) if protocol.is_empty() => Ok(Version::HTTP_11),
        (0, 9) => Ok(Version::HTTP_09),
        (1, 0) => Ok(Version::HTTP_10),
        (1, 1) => Ok(Version::HTTP_11),
        (2, 0) => Ok(Version::HTTP_2),
        (3, 0) => Ok(Version::HTTP_3),
        _ => Err(EnvelopeError::Protocol(format!(
            "{} ({}.{})",
            protocol, major, minor
        ))),
    }
}

/// Remove headers that only describe a single hop: the standard hop-by-hop set
/// plus anything named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }

    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}
