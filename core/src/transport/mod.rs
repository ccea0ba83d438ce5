//! Transport Layer
//!
//! The socket primitive and its implementations:
//! - `traits` — [`SocketTransport`], frames, events, errors
//! - `in_process` — paired transport for tests and embedding
//! - `websocket` — tokio-tungstenite transport (feature `websocket`)

pub mod in_process;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use in_process::{InProcessTransport, PeerSocket};
pub use traits::{RawFrame, SocketEvent, SocketHandle, SocketTransport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
