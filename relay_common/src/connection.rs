//! The message connection a session runs over.
//!
//! Anything that delivers discrete text/binary messages in order, reliably and in
//! both directions can back a [`MessageConnection`]: a WebSocket on either end of
//! the relay, or the in-memory [`MessageConnection::pair`] used by tests.
//!
//! Transport control frames (WebSocket ping/pong) never reach this layer; a close
//! frame or the end of the stream surfaces as [`TransportError::Closed`].

use crate::error::TransportError;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

/// Deadline applied to every connection the relay registers.
///
/// Liveness is the heartbeat's job, so transport deadlines are effectively off.
pub const LONG_DEADLINE: Duration = Duration::from_secs(100 * 60 * 60);

const PAIR_CAPACITY: usize = 64;

/// Per-direction deadlines for a single send or receive.
///
/// The effective limit in each direction is the smaller of that direction's value
/// and `overall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Duration,
    pub write: Duration,
    pub overall: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            read: LONG_DEADLINE,
            write: LONG_DEADLINE,
            overall: LONG_DEADLINE,
        }
    }
}

impl Deadlines {
    fn read_limit(&self) -> Duration {
        self.read.min(self.overall)
    }

    fn write_limit(&self) -> Duration {
        self.write.min(self.overall)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }
}

type BoxSink = Pin<Box<dyn Sink<Message, Error = TransportError> + Send>>;
type BoxStream = Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// Sending half of a connection.
pub struct MessageWriter {
    sink: BoxSink,
    deadline: Duration,
}

impl MessageWriter {
    pub async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        match tokio::time::timeout(self.deadline, self.sink.send(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(after = ?self.deadline, "Write deadline exceeded");
                Err(TransportError::Deadline {
                    op: "write",
                    after: self.deadline,
                })
            }
        }
    }

    /// Serialise `value` and send it as a text message.
    pub async fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(value)?;
        self.send(Message::Text(text)).await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await
    }
}

/// Receiving half of a connection.
pub struct MessageReader {
    stream: BoxStream,
    deadline: Duration,
}

impl MessageReader {
    /// Next message from the peer.
    ///
    /// Cancel safe: dropping the future before it completes loses nothing.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        match tokio::time::timeout(self.deadline, self.stream.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                debug!("Message stream ended");
                Err(TransportError::Closed)
            }
            Err(_) => {
                warn!(after = ?self.deadline, "Read deadline exceeded");
                Err(TransportError::Deadline {
                    op: "read",
                    after: self.deadline,
                })
            }
        }
    }

    /// Receive the next message and decode it as JSON. Text and binary are both accepted.
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let message = self.recv().await?;
        serde_json::from_slice(message.as_bytes()).map_err(|e| {
            warn!(bytes = message.as_bytes().len(), "Undecodable JSON message: {}", e);
            TransportError::from(e)
        })
    }
}

/// One bidirectional message connection.
pub struct MessageConnection {
    writer: MessageWriter,
    reader: MessageReader,
    peer: String,
}

impl MessageConnection {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Message, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Message, TransportError>> + Send + 'static,
    {
        let deadlines = Deadlines::default();
        Self {
            writer: MessageWriter {
                sink: Box::pin(sink),
                deadline: deadlines.write_limit(),
            },
            reader: MessageReader {
                stream: Box::pin(stream),
                deadline: deadlines.read_limit(),
            },
            peer: String::new(),
        }
    }

    /// Two in-memory endpoints wired to each other.
    pub fn pair() -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::channel(PAIR_CAPACITY);
        let (right_tx, right_rx) = mpsc::channel(PAIR_CAPACITY);
        (
            Self::from_channel(left_tx, right_rx).with_peer("memory:right"),
            Self::from_channel(right_tx, left_rx).with_peer("memory:left"),
        )
    }

    fn from_channel(tx: mpsc::Sender<Message>, rx: mpsc::Receiver<Message>) -> Self {
        let sink = PollSender::new(tx).sink_map_err(|_| TransportError::Closed);
        let stream = ReceiverStream::new(rx).map(Ok::<Message, TransportError>);
        Self::new(sink, stream)
    }

    /// Label used in logs for the remote end.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_deadlines(&mut self, deadlines: Deadlines) {
        self.writer.deadline = deadlines.write_limit();
        self.reader.deadline = deadlines.read_limit();
    }

    pub async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.writer.send(message).await
    }

    pub async fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), TransportError> {
        self.writer.send_json(value).await
    }

    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.reader.recv().await
    }

    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        self.reader.recv_json().await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }

    pub fn split(self) -> (MessageWriter, MessageReader) {
        (self.writer, self.reader)
    }
}
