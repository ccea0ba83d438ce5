//! WebSocket Transport
//!
//! `tokio-tungstenite` backed implementation of [`SocketTransport`].
//! Enabled with the `websocket` feature.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ConnectionRequest;
use crate::transport::{RawFrame, SocketEvent, SocketHandle, SocketTransport, TransportError};

/// Transport opening real WebSocket connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create the transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn open(&self, request: &ConnectionRequest) -> Result<SocketHandle, TransportError> {
        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidState(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidState(e.to_string()))?;
            handshake.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(handshake)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(url = %request.url, "websocket connected");
        let (mut write, mut read) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<RawFrame>();
        let (event_tx, events) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let message = match frame {
                    RawFrame::Text(text) => Message::Text(text),
                    RawFrame::Binary(bytes) => Message::Binary(bytes),
                };
                if let Err(e) = write.send(message).await {
                    tracing::warn!(error = %e, "websocket send failed");
                    break;
                }
            }
            // Sender dropped: close the socket.
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(item) = read.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if event_tx
                            .send(SocketEvent::Message(RawFrame::Text(text)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if event_tx
                            .send(SocketEvent::Message(RawFrame::Binary(bytes)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = event_tx.send(SocketEvent::Closed {
                            code,
                            reason,
                            clean: true,
                        });
                        return;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                    Err(e) => {
                        let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(SocketEvent::Closed {
                code: None,
                reason: String::new(),
                clean: false,
            });
        });

        Ok(SocketHandle { outgoing, events })
    }
}
