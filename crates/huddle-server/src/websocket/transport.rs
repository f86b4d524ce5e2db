//! Frame-level transport seam between a socket and its pump.
//!
//! The pump never touches axum types directly. A [`Transport`] is a boxed
//! sink/stream pair of [`Frame`]s, built either from an upgraded axum
//! socket or from in-memory channels ([`memory_pair`]) so pumps can be
//! driven without a network.

use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, future};

/// One WebSocket frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 data frame.
    Text(String),
    /// Binary data frame.
    Binary(Bytes),
    /// Keep-alive probe.
    Ping(Bytes),
    /// Keep-alive answer.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl Frame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b.len(),
            Self::Close => 0,
        }
    }

    /// Whether the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text payload, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Socket-level failure. Always fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer went away or the channel was dropped.
    #[error("connection closed")]
    Closed,

    /// A single write did not complete within the write deadline.
    #[error("write timed out")]
    WriteTimeout,

    /// Underlying socket error.
    #[error("socket error: {0}")]
    Io(String),
}

/// Inbound half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// A full-duplex frame transport.
pub struct Transport {
    /// Frames to the peer.
    pub sink: FrameSink,
    /// Frames from the peer.
    pub stream: FrameStream,
}

impl Transport {
    /// Wrap an upgraded axum socket.
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
        let stream = stream.map(|msg| {
            msg.map(Frame::from)
                .map_err(|e| TransportError::Io(e.to_string()))
        });
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(b) => Self::Binary(b),
            Frame::Ping(b) => Self::Ping(b),
            Frame::Pong(b) => Self::Pong(b),
            Frame::Close => Self::Close(None),
        }
    }
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Self::Text(text.as_str().to_owned()),
            Message::Binary(b) => Self::Binary(b),
            Message::Ping(b) => Self::Ping(b),
            Message::Pong(b) => Self::Pong(b),
            Message::Close(_) => Self::Close,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory transport
// ─────────────────────────────────────────────────────────────────────────────

/// Client end of an in-memory transport.
pub struct MemoryPeer {
    to_server: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

/// Create a connected in-memory transport and its client end.
pub fn memory_pair() -> (Transport, MemoryPeer) {
    let (to_server, server_rx) = mpsc::unbounded();
    let (server_tx, from_server) = mpsc::unbounded();
    let transport = Transport {
        sink: Box::pin(server_tx.sink_map_err(|_| TransportError::Closed)),
        stream: Box::pin(server_rx),
    };
    (
        transport,
        MemoryPeer {
            to_server,
            from_server,
        },
    )
}

impl MemoryPeer {
    /// Deliver a frame to the server.
    pub fn send(&self, frame: Frame) {
        let _ = self.to_server.unbounded_send(Ok(frame));
    }

    /// Deliver a text frame to the server.
    pub fn send_text(&self, text: impl Into<String>) {
        self.send(Frame::Text(text.into()));
    }

    /// Make the server's next read fail.
    pub fn fail(&self, error: TransportError) {
        let _ = self.to_server.unbounded_send(Err(error));
    }

    /// End the inbound stream, as if the peer hung up.
    pub fn hang_up(&self) {
        self.to_server.close_channel();
    }

    /// Next frame written by the server; `None` once the server closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_server.next().await
    }

    /// Next text frame parsed as JSON, skipping control frames.
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        while let Some(frame) = self.next_frame().await {
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// A frame the server already wrote, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.from_server.next().now_or_never().flatten()
    }
}
