//! In-Process Transport
//!
//! A paired transport with no I/O. Each `open` hands the other side of
//! the socket to whoever holds the peer receiver, which makes it the
//! workhorse for connection tests (a scripted peer plays the server)
//! and for embedding a fake backend in-process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ConnectionRequest;
use crate::transport::{RawFrame, SocketEvent, SocketHandle, SocketTransport, TransportError};

/// Transport whose sockets connect to in-process peers.
#[derive(Debug)]
pub struct InProcessTransport {
    peers: mpsc::UnboundedSender<PeerSocket>,
}

impl InProcessTransport {
    /// Create a transport and the receiver yielding one [`PeerSocket`]
    /// per successful `open`.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerSocket>) {
        let (peers, accept) = mpsc::unbounded_channel();
        (Self { peers }, accept)
    }
}

#[async_trait]
impl SocketTransport for InProcessTransport {
    async fn open(&self, _request: &ConnectionRequest) -> Result<SocketHandle, TransportError> {
        let (outgoing, incoming) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let peer = PeerSocket {
            incoming,
            events: event_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed("no peer listening".to_string()))?;
        Ok(SocketHandle { outgoing, events })
    }
}

/// The far side of an in-process socket.
#[derive(Debug)]
pub struct PeerSocket {
    incoming: mpsc::UnboundedReceiver<RawFrame>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl PeerSocket {
    /// Receive the next frame sent by the connection, `None` once the
    /// connection dropped its socket.
    pub async fn next_frame(&mut self) -> Option<RawFrame> {
        self.incoming.recv().await
    }

    /// Receive the next frame as text, panicking on a binary frame.
    /// Test convenience.
    pub async fn next_text(&mut self) -> Option<String> {
        match self.next_frame().await? {
            RawFrame::Text(text) => Some(text),
            RawFrame::Binary(bytes) => panic!("expected text frame, got {} binary bytes", bytes.len()),
        }
    }

    /// Inject a text frame.
    pub fn send_text(&self, text: &str) {
        let _ = self
            .events
            .send(SocketEvent::Message(RawFrame::Text(text.to_string())));
    }

    /// Inject a `Response` frame for `request_id`.
    pub fn respond(&self, request_id: i64, body: &str) {
        self.send_text(&format!("Response|{request_id}|{body}"));
    }

    /// Inject a `ResponseError` frame for `request_id`.
    pub fn respond_error(&self, request_id: i64, body: &str) {
        self.send_text(&format!("ResponseError|{request_id}|{body}"));
    }

    /// Inject an `Event` frame.
    pub fn send_event(&self, body: &str) {
        self.send_text(&format!("Event|{body}"));
    }

    /// Close the socket from the peer side.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self.events.send(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
            clean: true,
        });
    }

    /// Fail the socket from the peer side.
    pub fn fail(&self, error: &str) {
        let _ = self.events.send(SocketEvent::Error(error.to_string()));
    }
}
