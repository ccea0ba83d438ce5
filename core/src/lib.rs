//! chatwire core
//!
//! Headless session & messaging transport core for a real-time chat
//! client. Everything UI-less lives here: the pipe-delimited wire
//! protocol, request/response correlation, the auth/session state
//! machine, offline queueing, transcript redaction, and session
//! persistence.
//!
//! # Architecture
//!
//! ```text
//! host app ──> SocketConnection ──> OutgoingMessageSerializer ──> wire
//!                   │   ▲                                          │
//!                   │   └── IncomingMessageDeserializer <── SocketTransport
//!                   │
//!                   ├──> SavedSessionManager ──> SecureStore
//!                   └──> Censor (outbound text redaction)
//! ```
//!
//! # Key Concepts
//!
//! - **Correlation**: every outgoing request gets a connection-local
//!   numeric id; `Response`/`ResponseError` frames echo it back and are
//!   routed to the one-shot handler registered at send time.
//! - **Offline queue**: requests sent while disconnected or
//!   unauthenticated queue in FIFO order and flush after auth.
//! - **Session resume**: a persisted session is replayed on the next
//!   connect; a rejected resume clears it and retries once through the
//!   non-session auth flow.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chatwire_core::config::ChatConfig;
//! use chatwire_core::connection::SocketConnection;
//! use chatwire_core::session::SavedSessionManager;
//! use chatwire_core::storage::FileStore;
//! use chatwire_core::transport::InProcessTransport;
//! use chatwire_core::user::StaticUser;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChatConfig::new("demo", "demo.example.com", "secret");
//! let (transport, _peer) = InProcessTransport::new();
//! let sessions = SavedSessionManager::new(Arc::new(FileStore::default_dir()?));
//! let connection = SocketConnection::new(
//!     config,
//!     Arc::new(StaticUser::anonymous()),
//!     Arc::new(transport),
//!     sessions,
//! );
//! connection.connect().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod censor;
pub mod config;
pub mod connection;
pub mod incoming;
pub mod serializer;
pub mod session;
pub mod storage;
pub mod transport;
pub mod user;
pub mod wire;

pub use censor::{Censor, Replacement, Rule, RuleType, Search};
pub use config::{ChatConfig, ConnectionRequest};
pub use connection::{
    AuthError, RequestCompletion, RequestHandler, SocketConnection, SocketConnectionDelegate,
};
pub use incoming::{IncomingMessage, IncomingMessageDeserializer, MessageType};
pub use serializer::{AuthRequest, OutgoingMessageSerializer, SocketRequest};
pub use session::{SavedSessionManager, Session};
pub use storage::{FileStore, MemoryStore, SecureStore};
pub use transport::{InProcessTransport, SocketTransport};
pub use user::{StaticUser, UserIdentity, UserLoginAction};
pub use wire::JsonObject;
