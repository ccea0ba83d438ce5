//! Socket Connection
//!
//! The connection state machine: opens the socket, runs the auth
//! handshake, correlates responses to requests, queues requests while
//! offline or unauthenticated, and polls for reconnection.
//!
//! # Threading
//!
//! A [`SocketConnection`] is a cheap clone over shared state. No public
//! call blocks on the network: sends while disconnected are queued and
//! flushed after the next successful auth. Inbound frames are processed
//! on one spawned reader task per socket; handlers and delegate
//! callbacks run there, never under an internal lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ChatConfig;
use crate::incoming::{IncomingMessage, IncomingMessageDeserializer, MessageType};
use crate::serializer::{OutgoingMessageSerializer, SocketRequest};
use crate::session::{SavedSessionManager, Session};
use crate::transport::{RawFrame, SocketEvent, SocketTransport};
use crate::user::{UserIdentity, UserLoginAction};
use crate::wire::JsonObject;

/// Interval of the reconnection poll.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Analytics path whose sends are not logged.
const ANALYTICS_PATH: &str = "srs/PutMAEvent";

/// Invoked once with the correlated response, the original request if
/// still known, and the round-trip time in milliseconds (-1 when the
/// send time is unknown).
pub type RequestHandler = Box<dyn FnOnce(&IncomingMessage, Option<&SocketRequest>, i64) + Send>;

/// Invoked once when a multi-step operation finishes: the final
/// response if any, and an error description on failure.
pub type RequestCompletion = Box<dyn FnOnce(Option<&IncomingMessage>, Option<&str>) + Send>;

/// Host-side observer of connection lifecycle and inbound traffic.
pub trait SocketConnectionDelegate: Send + Sync {
    /// The connection is open and authenticated; queued requests have
    /// been flushed.
    fn on_established(&self);
    /// Authentication failed; the connection is open but unusable.
    fn on_auth_failure(&self);
    /// The socket dropped outside a manual disconnect.
    fn on_lost_connection(&self);
    /// Every decoded inbound message, after any correlated handler ran.
    fn on_message_received(&self, message: &IncomingMessage);
}

/// Authentication failure.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The socket went away mid-handshake.
    #[error("connection closed during authentication")]
    ConnectionClosed,
    /// The server rejected the request.
    #[error("authentication rejected: {0}")]
    Rejected(String),
}

#[derive(Clone, Copy)]
enum DropKind {
    Closed,
    Errored,
}

struct ConnState {
    socket: Option<mpsc::UnboundedSender<RawFrame>>,
    open: bool,
    authenticated: bool,
    connecting: bool,
    manually_disconnected: bool,
    /// Bumped on every connect and manual disconnect; a reader task
    /// whose generation is stale ignores everything it sees.
    generation: u64,
    queue: VecDeque<SocketRequest>,
    handlers: HashMap<i64, RequestHandler>,
    send_times: HashMap<i64, Instant>,
    lookup: HashMap<i64, SocketRequest>,
}

struct Inner {
    config: ChatConfig,
    transport: Arc<dyn SocketTransport>,
    saved_sessions: SavedSessionManager,
    delegate: Mutex<Option<Arc<dyn SocketConnectionDelegate>>>,
    /// Held across the identity provider's async context fetch during
    /// auth. Lock order: serializer before state, never the reverse.
    serializer: tokio::sync::Mutex<OutgoingMessageSerializer>,
    state: Mutex<ConnState>,
}

/// A connection to the chat server.
pub struct SocketConnection {
    inner: Arc<Inner>,
}

impl Clone for SocketConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SocketConnection {
    /// Create a connection.
    ///
    /// Adopts the persisted session when it belongs to the current
    /// user; a persisted anonymous session for a now-identified user
    /// stages an account merge; anything else is cleared.
    #[must_use]
    pub fn new(
        config: ChatConfig,
        user: Arc<dyn UserIdentity>,
        transport: Arc<dyn SocketTransport>,
        saved_sessions: SavedSessionManager,
    ) -> Self {
        let mut session = None;
        let mut user_login_action = None;
        if let Some(saved) = saved_sessions.get_session() {
            let identifier = user.user_identifier();
            if saved.matches_identifier(identifier.as_deref()) {
                session = Some(saved);
            } else if saved.is_anonymous() && !user.is_anonymous() {
                tracing::info!("staging account merge from saved anonymous session");
                user_login_action = Some(UserLoginAction {
                    previous_session: Some(saved),
                });
            } else {
                tracing::info!("persisted session does not match user, clearing");
                saved_sessions.clear_session();
            }
        }

        let mut serializer = OutgoingMessageSerializer::new(config.clone(), user, user_login_action);
        if let Some(session) = session {
            serializer.set_session(Some(session));
        }

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                saved_sessions,
                delegate: Mutex::new(None),
                serializer: tokio::sync::Mutex::new(serializer),
                state: Mutex::new(ConnState {
                    socket: None,
                    open: false,
                    authenticated: false,
                    connecting: false,
                    manually_disconnected: false,
                    generation: 0,
                    queue: VecDeque::new(),
                    handlers: HashMap::new(),
                    send_times: HashMap::new(),
                    lookup: HashMap::new(),
                }),
            }),
        }
    }

    /// Set the lifecycle observer.
    pub fn set_delegate(&self, delegate: Arc<dyn SocketConnectionDelegate>) {
        *self.inner.delegate.lock() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn SocketConnectionDelegate>> {
        self.inner.delegate.lock().clone()
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().open
    }

    /// Whether the connection is authenticated.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().authenticated
    }

    /// Open the socket and run the auth handshake. A no-op when
    /// already open or already connecting.
    ///
    /// Also arms the reconnection poll: after [`RECONNECT_DELAY`], if
    /// the connection is neither open nor manually disconnected,
    /// `connect` runs again.
    pub async fn connect(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.open || state.connecting {
                return;
            }
            state.connecting = true;
            state.manually_disconnected = false;
            state.generation += 1;
        }
        self.schedule_reconnect();

        let request = self.inner.config.connection_request();
        tracing::debug!(url = %request.url, "opening socket");
        match self.inner.transport.open(&request).await {
            Ok(handle) => {
                let generation = {
                    let mut state = self.inner.state.lock();
                    state.connecting = false;
                    if state.manually_disconnected {
                        // Raced with a manual disconnect; drop the socket.
                        return;
                    }
                    state.socket = Some(handle.outgoing);
                    state.open = true;
                    state.generation
                };
                self.spawn_reader(handle.events, generation);
                self.handle_socket_open().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "socket open failed");
                let retry = {
                    let mut state = self.inner.state.lock();
                    state.connecting = false;
                    !state.manually_disconnected
                };
                // A poll that fired while the open was still in flight
                // saw `connecting` and skipped, so arm a fresh one.
                if retry {
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// `connect` on a fresh task.
    pub fn connect_in_background(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.connect().await;
        });
    }

    /// Close the socket and stay closed until the next `connect`.
    ///
    /// Tears down all pending work: the offline queue and the handlers
    /// of in-flight requests are dropped.
    pub fn disconnect(&self) {
        tracing::debug!("manual disconnect");
        let mut state = self.inner.state.lock();
        state.manually_disconnected = true;
        state.generation += 1;
        state.socket = None;
        state.open = false;
        state.authenticated = false;
        state.connecting = false;
        state.queue.clear();
        state.handlers.clear();
        state.send_times.clear();
        state.lookup.clear();
    }

    fn schedule_reconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let should_retry = {
                let state = inner.state.lock();
                !state.open && !state.connecting && !state.manually_disconnected
            };
            if should_retry {
                tracing::debug!("reconnect poll firing");
                SocketConnection { inner }.connect().await;
            }
        });
    }

    /// Build and send a request. With no connection the request is
    /// queued and a connect is kicked off; while unauthenticated it is
    /// queued until auth completes.
    pub async fn send_request(
        &self,
        path: &str,
        params: Option<JsonObject>,
        context: Option<JsonObject>,
        handler: Option<RequestHandler>,
    ) {
        let request = {
            let mut serializer = self.inner.serializer.lock().await;
            serializer.create_request(path, params, context)
        };
        if let Some(handler) = handler {
            self.inner
                .state
                .lock()
                .handlers
                .insert(request.request_id(), handler);
        }
        self.attempt_send(request, false).await;
    }

    /// Build and send a binary request (attachment upload).
    pub async fn send_request_with_data(&self, data: Vec<u8>, handler: Option<RequestHandler>) {
        let request = {
            let mut serializer = self.inner.serializer.lock().await;
            serializer.create_request_with_data(data)
        };
        if let Some(handler) = handler {
            self.inner
                .state
                .lock()
                .handlers
                .insert(request.request_id(), handler);
        }
        self.attempt_send(request, false).await;
    }

    async fn attempt_send(&self, request: SocketRequest, is_auth_request: bool) {
        let request_string = if request.request_data().is_none() {
            let serializer = self.inner.serializer.lock().await;
            Some(serializer.create_request_string(&request))
        } else {
            None
        };

        let mut trigger_connect = false;
        {
            let mut state = self.inner.state.lock();
            if state.open {
                if is_auth_request || state.authenticated {
                    if request.path() != ANALYTICS_PATH {
                        tracing::debug!(request = %request.loggable_description(), "sending request");
                    }
                    state.send_times.insert(request.request_id(), Instant::now());
                    let frame = match (&request_string, request.request_data()) {
                        (Some(text), _) => RawFrame::Text(text.clone()),
                        (None, Some(data)) => RawFrame::Binary(data.to_vec()),
                        (None, None) => return,
                    };
                    let request_id = request.request_id();
                    state.lookup.insert(request_id, request);
                    let sent = state
                        .socket
                        .as_ref()
                        .is_some_and(|socket| socket.send(frame).is_ok());
                    if !sent {
                        tracing::warn!(request_id, "socket send failed, frame dropped");
                    }
                } else {
                    tracing::debug!(path = %request.path(), "not authenticated, queueing request");
                    state.queue.push_back(request);
                }
            } else {
                tracing::debug!(path = %request.path(), "not connected, queueing request");
                state.queue.push_back(request);
                trigger_connect = true;
            }
        }
        if trigger_connect {
            self.connect_in_background();
        }
    }

    async fn handle_socket_open(&self) {
        match self.authenticate().await {
            Ok(_message) => {
                self.flush_queued_requests().await;
                if let Some(delegate) = self.delegate() {
                    delegate.on_established();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "authentication failed");
                if let Some(delegate) = self.delegate() {
                    delegate.on_auth_failure();
                }
            }
        }
    }

    /// Flush the offline queue in FIFO order.
    async fn flush_queued_requests(&self) {
        let drained: Vec<SocketRequest> = {
            let mut state = self.inner.state.lock();
            state.queue.drain(..).collect()
        };
        for request in drained {
            self.attempt_send(request, false).await;
        }
    }

    /// Run the auth handshake for the current state.
    ///
    /// A rejected session resume clears the persisted session and is
    /// retried exactly once through the non-session flow.
    pub async fn authenticate(&self) -> Result<IncomingMessage, AuthError> {
        let mut retried = false;
        loop {
            let auth = {
                let mut serializer = self.inner.serializer.lock().await;
                serializer.create_auth_request(retried).await
            };
            let request_id = auth.request.request_id();

            let (tx, rx) = oneshot::channel::<IncomingMessage>();
            {
                let mut state = self.inner.state.lock();
                state.handlers.insert(
                    request_id,
                    Box::new(move |message, _original, _elapsed| {
                        let _ = tx.send(message.clone());
                    }),
                );
            }
            self.attempt_send(auth.request.clone(), true).await;

            // Teardown drops the handler, which closes the channel.
            let Ok(message) = rx.await else {
                return Err(AuthError::ConnectionClosed);
            };

            if message.message_type == Some(MessageType::Response) {
                match message
                    .body
                    .as_ref()
                    .and_then(Session::from_auth_body)
                {
                    Some(session) => {
                        self.inner.saved_sessions.save(Some(&session));
                        let mut serializer = self.inner.serializer.lock().await;
                        serializer.update_with_auth_response(session);
                    }
                    None => tracing::warn!("auth response carried no usable session info"),
                }
                self.inner.state.lock().authenticated = true;
                return Ok(message);
            }

            self.inner.state.lock().authenticated = false;
            if auth.is_session_auth {
                tracing::info!("session resume rejected, clearing persisted session");
                self.inner.saved_sessions.clear_session();
                self.inner.serializer.lock().await.set_session(None);
                if !retried {
                    retried = true;
                    continue;
                }
            }
            return Err(AuthError::Rejected(
                message
                    .debug_error
                    .clone()
                    .unwrap_or_else(|| "authentication failed".to_string()),
            ));
        }
    }

    fn spawn_reader(&self, mut events: mpsc::UnboundedReceiver<SocketEvent>, generation: u64) {
        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if conn.inner.state.lock().generation != generation {
                    return;
                }
                match event {
                    SocketEvent::Message(frame) => conn.handle_frame(&frame),
                    SocketEvent::Closed { code, reason, clean } => {
                        tracing::debug!(code = ?code, reason = %reason, clean, "socket closed");
                        conn.handle_connection_dropped(generation, DropKind::Closed);
                        return;
                    }
                    SocketEvent::Error(error) => {
                        tracing::warn!(error = %error, "socket errored");
                        conn.handle_connection_dropped(generation, DropKind::Errored);
                        return;
                    }
                }
            }
            // Stream ended without a close event.
            conn.handle_connection_dropped(generation, DropKind::Closed);
        });
    }

    /// Transient socket loss: forget the socket but keep the queue and
    /// pending handlers, notify the delegate, and arm the reconnect
    /// poll. A close and a failure are distinct notifications even
    /// though both leave the connection unusable until reconnect.
    fn handle_connection_dropped(&self, generation: u64, kind: DropKind) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.socket = None;
            state.open = false;
            state.authenticated = false;
        }
        if let Some(delegate) = self.delegate() {
            match kind {
                DropKind::Closed => delegate.on_lost_connection(),
                DropKind::Errored => delegate.on_auth_failure(),
            }
        }
        self.schedule_reconnect();
    }

    fn handle_frame(&self, frame: &RawFrame) {
        let message = IncomingMessageDeserializer.deserialize(frame);

        if let Some(request_id) = message.request_id {
            let (handler, original, response_time_ms) = {
                let mut state = self.inner.state.lock();
                let original = state.lookup.remove(&request_id);
                let response_time_ms = state
                    .send_times
                    .remove(&request_id)
                    .map_or(-1, |sent_at| {
                        i64::try_from(sent_at.elapsed().as_millis()).unwrap_or(i64::MAX)
                    });
                (state.handlers.remove(&request_id), original, response_time_ms)
            };
            if let Some(original) = &original {
                tracing::debug!(
                    path = %original.path(),
                    uuid = %original.request_uuid(),
                    response_time_ms,
                    "response received"
                );
            }
            if let Some(handler) = handler {
                handler(&message, original.as_ref(), response_time_ms);
            }
        } else {
            tracing::debug!(message_type = ?message.message_type, "message received");
        }

        if let Some(delegate) = self.delegate() {
            delegate.on_message_received(&message);
        }
    }

    /// Target a customer by CRM id: resolve the customer, then join
    /// their issue. The serializer's default context switches to the
    /// issue once the second step lands.
    pub async fn update_customer_by_crm_customer_id(
        &self,
        target_customer_token: &str,
        completion: Option<RequestCompletion>,
    ) {
        {
            let mut serializer = self.inner.serializer.lock().await;
            serializer.set_target_customer_token(Some(target_customer_token.to_string()));
        }

        let conn = self.clone();
        let mut params = JsonObject::new();
        params.insert(
            "CRMCustomerId".to_string(),
            serde_json::Value::String(target_customer_token.to_string()),
        );
        self.send_request(
            "rep/GetCustomerByCRMCustomerId",
            Some(params),
            None,
            Some(Box::new(move |response, _original, _elapsed| {
                let customer_id = response
                    .body
                    .as_ref()
                    .and_then(|body| body.get("Customer"))
                    .and_then(serde_json::Value::as_object)
                    .and_then(|customer| customer.get("CustomerId"))
                    .and_then(serde_json::Value::as_u64);
                match customer_id {
                    Some(customer_id) => {
                        tokio::spawn(async move {
                            conn.participate_in_issue_for_customer(customer_id, completion)
                                .await;
                        });
                    }
                    None => {
                        tracing::error!("customer lookup response carried no customer id");
                        if let Some(completion) = completion {
                            completion(Some(response), Some("failed to resolve customer"));
                        }
                    }
                }
            })),
        )
        .await;
    }

    /// Join the targeted customer's issue and adopt its id as the
    /// default request context.
    pub async fn participate_in_issue_for_customer(
        &self,
        customer_id: u64,
        completion: Option<RequestCompletion>,
    ) {
        let conn = self.clone();
        let mut context = JsonObject::new();
        context.insert(
            "CustomerId".to_string(),
            serde_json::Value::from(customer_id),
        );
        self.send_request(
            "rep/ParticipateInIssueForCustomer",
            None,
            Some(context),
            Some(Box::new(move |response, _original, _elapsed| {
                let issue_id = response
                    .body
                    .as_ref()
                    .and_then(|body| body.get("IssueId"))
                    .and_then(serde_json::Value::as_i64);
                match issue_id {
                    Some(issue_id) => {
                        let response = response.clone();
                        tokio::spawn(async move {
                            conn.inner.serializer.lock().await.set_issue_id(issue_id);
                            if let Some(completion) = completion {
                                completion(Some(&response), None);
                            }
                        });
                    }
                    None => {
                        tracing::error!("participate response carried no issue id");
                        if let Some(completion) = completion {
                            completion(Some(response), Some("failed to get issue id"));
                        }
                    }
                }
            })),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::user::StaticUser;
    use crate::session::tests::auth_body;

    fn manager() -> SavedSessionManager {
        SavedSessionManager::new(Arc::new(MemoryStore::new()))
    }

    fn connection_with(
        user: StaticUser,
        saved_sessions: SavedSessionManager,
    ) -> (SocketConnection, tokio::sync::mpsc::UnboundedReceiver<crate::transport::PeerSocket>)
    {
        let (transport, accept) = crate::transport::InProcessTransport::new();
        let config = ChatConfig::new("demo", "demo.example.com", "s3cret");
        let conn = SocketConnection::new(
            config,
            Arc::new(user),
            Arc::new(transport),
            saved_sessions,
        );
        (conn, accept)
    }

    #[tokio::test]
    async fn test_new_connection_is_disconnected() {
        let (conn, _accept) = connection_with(StaticUser::anonymous(), manager());
        assert!(!conn.is_connected());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_constructor_adopts_matching_saved_session() {
        let saved_sessions = manager();
        let session = Session::from_auth_body(&auth_body(Some("user-1"))).unwrap();
        saved_sessions.save(Some(&session));

        let (conn, _accept) =
            connection_with(StaticUser::identified("user-1"), saved_sessions);
        let serializer = conn.inner.serializer.lock().await;
        assert_eq!(serializer.session(), Some(&session));
        assert!(serializer.user_login_action().is_none());
    }

    #[tokio::test]
    async fn test_constructor_stages_merge_for_anonymous_session() {
        let saved_sessions = manager();
        let session = Session::from_auth_body(&auth_body(None)).unwrap();
        saved_sessions.save(Some(&session));

        let (conn, _accept) =
            connection_with(StaticUser::identified("user-1"), saved_sessions);
        let serializer = conn.inner.serializer.lock().await;
        assert!(serializer.session().is_none());
        let action = serializer.user_login_action().unwrap();
        assert_eq!(action.merge_customer_id(), Some(9000));
    }

    #[tokio::test]
    async fn test_constructor_clears_mismatched_session() {
        let store: Arc<dyn crate::storage::SecureStore> = Arc::new(MemoryStore::new());
        let saved_sessions = SavedSessionManager::new(Arc::clone(&store));
        let session = Session::from_auth_body(&auth_body(Some("user-1"))).unwrap();
        saved_sessions.save(Some(&session));

        let (conn, _accept) =
            connection_with(StaticUser::identified("user-2"), saved_sessions);
        let serializer = conn.inner.serializer.lock().await;
        assert!(serializer.session().is_none());
        assert!(serializer.user_login_action().is_none());
        drop(serializer);
        assert!(SavedSessionManager::new(store).get_session().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_clears_pending_work() {
        let (conn, _accept) = connection_with(StaticUser::anonymous(), manager());
        let request = {
            let mut serializer = conn.inner.serializer.lock().await;
            serializer.create_request("a", None, None)
        };
        conn.inner.state.lock().queue.push_back(request);
        conn.disconnect();
        let state = conn.inner.state.lock();
        assert!(state.manually_disconnected);
        assert!(state.queue.is_empty());
        assert!(state.handlers.is_empty());
    }
}
