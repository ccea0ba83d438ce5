//! Transport Traits
//!
//! The socket primitive the connection is built on. A transport only
//! knows how to open a connection described by a
//! [`ConnectionRequest`]; everything above (framing, auth, queueing)
//! lives in the connection.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConnectionRequest;

/// A socket frame, in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

/// Events produced by an open socket.
#[derive(Clone, Debug)]
pub enum SocketEvent {
    /// A frame arrived from the peer.
    Message(RawFrame),
    /// The socket closed.
    Closed {
        /// Close code, when the peer supplied one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
        /// Whether the close handshake completed cleanly.
        clean: bool,
    },
    /// The socket failed.
    Error(String),
}

/// Errors opening or driving a socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the peer failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// Failed to send a frame.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// Transport not in the expected state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// IO error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open socket: a sender for outbound frames and a stream of
/// inbound events.
///
/// Dropping the sender closes the socket. The event stream ends after
/// a [`SocketEvent::Closed`] or [`SocketEvent::Error`], or when the
/// transport tears down.
#[derive(Debug)]
pub struct SocketHandle {
    /// Outbound frames.
    pub outgoing: mpsc::UnboundedSender<RawFrame>,
    /// Inbound events.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// A way of opening sockets.
///
/// `open` resolving successfully is the "socket opened" signal; there
/// is no separate callback.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Open a connection.
    async fn open(&self, request: &ConnectionRequest) -> Result<SocketHandle, TransportError>;
}
