//! Buffered response writer.
//!
//! [`ResponseCapture`] stands in for a real response writer on the backend side:
//! the local handler writes into it, the capture travels back over the tunnel as
//! the response envelope, and the relay replays it onto the real writer.

use crate::envelope::RequestEnvelope;
use crate::error::EnvelopeError;
use bytes::BytesMut;
use http::{HeaderMap, StatusCode, Version};
use serde::{Deserialize, Serialize};
use std::io;

/// The response-writer capability.
///
/// Real writers are order sensitive: headers must be set before the status is
/// written, and the status before the body.
pub trait ResponseSink {
    /// Mutable header map for the response.
    fn header(&mut self) -> &mut HeaderMap;

    /// Record the status code.
    fn write_status(&mut self, status: StatusCode);

    /// Append body bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Captured response, serialised as the response envelope.
///
/// `status_code == 0` means no status was ever written; replay then leaves the
/// choice to the real writer (conventionally 200).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseCapture {
    pub status: String,
    pub status_code: u16,
    pub protocol: String,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    #[serde(with = "crate::wire::header_multimap")]
    pub headers: HeaderMap,
    #[serde(with = "crate::wire::base64_bytes")]
    pub body: BytesMut,
    pub content_length: i64,
    pub transfer_encoding: Vec<String>,
    pub close: bool,
    /// Trailers reported by the handler. They travel with the envelope but the
    /// sink contract has no trailer step, so `replay` leaves them out.
    #[serde(with = "crate::wire::header_multimap")]
    pub trailer: HeaderMap,
    /// The request this responds to, body omitted.
    pub request_envelope: Option<Box<RequestEnvelope>>,
    pub error: Option<String>,
}

impl ResponseCapture {
    /// Capture that reports a failure instead of a response.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Whether a status code has been written.
    pub fn has_status(&self) -> bool {
        self.status_code != 0
    }

    /// Fill in the transport-level fields once the handler is done writing.
    pub fn finish(&mut self, version: Version) {
        let (protocol, major, minor) = match version {
            Version::HTTP_10 => ("HTTP/1.0", 1, 0),
            Version::HTTP_2 => ("HTTP/2.0", 2, 0),
            Version::HTTP_3 => ("HTTP/3.0", 3, 0),
            _ => ("HTTP/1.1", 1, 1),
        };
        self.protocol = protocol.to_string();
        self.protocol_major = major;
        self.protocol_minor = minor;
        self.content_length = self.body.len() as i64;
        self.transfer_encoding = self
            .headers
            .get_all(http::header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
        self.close = self
            .headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
    }

    /// Status to replay, if one was recorded.
    pub fn recorded_status(&self) -> Result<Option<StatusCode>, EnvelopeError> {
        if !self.has_status() {
            return Ok(None);
        }
        StatusCode::from_u16(self.status_code)
            .map(Some)
            .map_err(|_| EnvelopeError::Status(self.status_code))
    }

    /// Apply this capture to a real writer: headers, then status (only if one was
    /// recorded), then the body.
    pub fn replay<S: ResponseSink + ?Sized>(&self, sink: &mut S) -> io::Result<()> {
        let status = self
            .recorded_status()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let headers = sink.header();
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        if let Some(status) = status {
            sink.write_status(status);
        }

        let mut written = 0;
        while written < self.body.len() {
            match sink.write(&self.body[written..])? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                n => written += n,
            }
        }
        Ok(())
    }
}

impl ResponseSink for ResponseCapture {
    fn header(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        self.status_code = status.as_u16();
        self.status = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }
}
