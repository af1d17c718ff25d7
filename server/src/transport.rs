//! Frame contract between the delivery pumps and the wire.
//!
//! The pumps speak [`Frame`] over any `Stream`/`Sink` pair whose error type is
//! [`TransportError`]. [`split_socket`] adapts an axum WebSocket to that
//! contract; tests drive the pumps with in-memory streams instead.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Liveness check.
    Ping(Vec<u8>),
    /// Liveness acknowledgment.
    Pong(Vec<u8>),
    Close,
}

/// Failures that end a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying WebSocket failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    /// No frame arrived within the read deadline.
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    /// A write did not complete within the write deadline.
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    /// An inbound frame exceeded the size ceiling.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// An inbound frame was not a valid message.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The peer went away.
    #[error("connection closed")]
    Closed,
}

impl From<WsMessage> for Frame {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Self::Text(text.as_str().to_owned()),
            WsMessage::Binary(bytes) => Self::Binary(bytes.to_vec()),
            WsMessage::Ping(bytes) => Self::Ping(bytes.to_vec()),
            WsMessage::Pong(bytes) => Self::Pong(bytes.to_vec()),
            WsMessage::Close(_) => Self::Close,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(bytes) => Self::Binary(bytes.into()),
            Frame::Ping(bytes) => Self::Ping(bytes.into()),
            Frame::Pong(bytes) => Self::Pong(bytes.into()),
            Frame::Close => Self::Close(None),
        }
    }
}

/// Splits an upgraded WebSocket into a frame sink and a frame stream.
pub fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = TransportError> + Unpin + Send,
    impl Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, TransportError>(WsMessage::from(frame))));
    let stream = stream.map(|msg| msg.map(Frame::from).map_err(TransportError::from));
    (sink, stream)
}
