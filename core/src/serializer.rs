//! Outgoing Messages
//!
//! Builds [`SocketRequest`]s, allocates request ids, renders requests
//! for the wire, and constructs auth requests for the three auth
//! flows (session resume, identified customer, anonymous account).
//!
//! One serializer belongs to one connection. It is the only allocator
//! of request ids for that connection, which is what makes correlation
//! of responses sound.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::{ChatConfig, CLIENT_TYPE};
use crate::session::Session;
use crate::user::{UserIdentity, UserLoginAction};
use crate::wire::{self, JsonObject};

/// Reserved params key carrying the per-request UUID.
pub const RESERVED_REQUEST_ID_KEY: &str = "RequestId";

/// Auth path that resumes a saved session.
pub const AUTH_WITH_SESSION_PATH: &str = "auth/AuthenticateWithSession";

/// Auth path for an identified customer.
pub const AUTH_WITH_IDENTIFIER_PATH: &str = "auth/AuthenticateWithCustomerIdentifier";

/// Auth path creating an anonymous account.
pub const AUTH_ANONYMOUS_PATH: &str = "auth/CreateAnonCustomerAccount";

/// Ids are allocated by pre-increment, so the first issued id is 2.
const REQUEST_ID_SENTINEL: i64 = 1;

/// An outgoing request.
///
/// `params` always carries the request UUID under
/// [`RESERVED_REQUEST_ID_KEY`]; a caller-supplied value under that key
/// is overwritten.
#[derive(Clone, Debug)]
pub struct SocketRequest {
    request_id: i64,
    path: String,
    params: JsonObject,
    context: Option<JsonObject>,
    request_data: Option<Vec<u8>>,
    request_uuid: String,
}

impl SocketRequest {
    fn new(
        request_id: i64,
        path: &str,
        params: Option<JsonObject>,
        context: Option<JsonObject>,
        request_data: Option<Vec<u8>>,
    ) -> Self {
        let request_uuid = Uuid::new_v4().to_string();
        let mut params = params.unwrap_or_default();
        params.insert(
            RESERVED_REQUEST_ID_KEY.to_string(),
            Value::String(request_uuid.clone()),
        );
        Self {
            request_id,
            path: path.to_string(),
            params,
            context,
            request_data,
            request_uuid,
        }
    }

    /// Numeric correlation id.
    #[must_use]
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Request path, empty for binary requests.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request params, including the request UUID.
    #[must_use]
    pub fn params(&self) -> &JsonObject {
        &self.params
    }

    /// Explicit request context, when one was supplied.
    #[must_use]
    pub fn context(&self) -> Option<&JsonObject> {
        self.context.as_ref()
    }

    /// Payload for binary requests.
    #[must_use]
    pub fn request_data(&self) -> Option<&[u8]> {
        self.request_data.as_deref()
    }

    /// Per-request UUID, also present in params.
    #[must_use]
    pub fn request_uuid(&self) -> &str {
        &self.request_uuid
    }

    /// Whether this request carries payment data that must never be
    /// logged.
    #[must_use]
    pub fn contains_sensitive_data(&self) -> bool {
        self.path.contains("CreditCard")
    }

    /// Params safe to log: card number and CVV values are replaced
    /// with placeholders on sensitive paths.
    #[must_use]
    pub fn scrubbed_params(&self) -> JsonObject {
        let mut params = self.params.clone();
        if self.contains_sensitive_data() {
            if params.contains_key("Number") {
                params.insert("Number".to_string(), Value::String("xxxx".to_string()));
            }
            if params.contains_key("CVV") {
                params.insert("CVV".to_string(), Value::String("xxx".to_string()));
            }
        }
        params
    }

    /// Wire-shaped rendering with scrubbed params, for logging only.
    #[must_use]
    pub fn loggable_description(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.path,
            self.request_id,
            wire::stringify(self.context.as_ref()),
            wire::stringify(Some(&self.scrubbed_params()))
        )
    }
}

/// An auth request plus which flow produced it.
#[derive(Clone, Debug)]
pub struct AuthRequest {
    /// The request to send.
    pub request: SocketRequest,
    /// True when the request resumes a saved session; a rejected
    /// session-resume clears the session and is retried once.
    pub is_session_auth: bool,
}

/// Builds and renders outgoing requests for one connection.
pub struct OutgoingMessageSerializer {
    config: ChatConfig,
    user: Arc<dyn UserIdentity>,
    session: Option<Session>,
    user_login_action: Option<UserLoginAction>,
    my_id: u64,
    issue_id: i64,
    target_customer_token: Option<String>,
    customer_target_company_id: i64,
    current_request_id: i64,
}

impl OutgoingMessageSerializer {
    /// Create a serializer. `user_login_action` stages an
    /// anonymous-to-identified merge for the next auth.
    #[must_use]
    pub fn new(
        config: ChatConfig,
        user: Arc<dyn UserIdentity>,
        user_login_action: Option<UserLoginAction>,
    ) -> Self {
        Self {
            config,
            user,
            session: None,
            user_login_action,
            my_id: 0,
            issue_id: 0,
            target_customer_token: None,
            customer_target_company_id: 0,
            current_request_id: REQUEST_ID_SENTINEL,
        }
    }

    fn next_request_id(&mut self) -> i64 {
        self.current_request_id += 1;
        self.current_request_id
    }

    /// Build a request with a fresh id.
    pub fn create_request(
        &mut self,
        path: &str,
        params: Option<JsonObject>,
        context: Option<JsonObject>,
    ) -> SocketRequest {
        SocketRequest::new(self.next_request_id(), path, params, context, None)
    }

    /// Build a binary request (attachment upload) with a fresh id.
    pub fn create_request_with_data(&mut self, data: Vec<u8>) -> SocketRequest {
        SocketRequest::new(self.next_request_id(), "", None, None, Some(data))
    }

    /// Render a text request for the wire. A request without an
    /// explicit context gets the current context snapshot.
    #[must_use]
    pub fn create_request_string(&self, request: &SocketRequest) -> String {
        let default_context;
        let context = match request.context() {
            Some(context) => Some(context),
            None => {
                default_context = self.context_for_path(request.path());
                Some(&default_context)
            }
        };
        wire::encode_request(request.path(), request.request_id(), context, Some(request.params()))
    }

    /// Context applied to requests that carry none of their own: the
    /// target issue when an admin has targeted a customer (except on
    /// customer endpoints), otherwise the company.
    fn context_for_path(&self, path: &str) -> JsonObject {
        let mut context = JsonObject::new();
        if self.target_customer_token.is_some() && !path.starts_with("customer/") {
            context.insert("IssueId".to_string(), Value::from(self.issue_id));
        } else {
            context.insert(
                "CompanyId".to_string(),
                Value::from(self.customer_target_company_id),
            );
        }
        context
    }

    /// Build the auth request for the current state: session resume
    /// when a session is held, the identified flow for an identified
    /// user, the anonymous flow otherwise.
    ///
    /// `context_needs_refresh` is forwarded to the identity provider
    /// so hosts can mint a fresh token after a rejection.
    pub async fn create_auth_request(&mut self, context_needs_refresh: bool) -> AuthRequest {
        let mut params = JsonObject::new();
        params.insert("App".to_string(), Value::String(CLIENT_TYPE.to_string()));
        params.insert(
            "CompanyMarker".to_string(),
            Value::String(self.config.app_id.clone()),
        );
        params.insert(
            "RegionCode".to_string(),
            Value::String(self.config.region_code.clone()),
        );

        let path;
        let mut is_session_auth = false;

        if let Some(session) = &self.session {
            path = AUTH_WITH_SESSION_PATH;
            is_session_auth = true;
            params.insert("SessionInfo".to_string(), session.session_info());
        } else if !self.user.is_anonymous() {
            path = AUTH_WITH_IDENTIFIER_PATH;
            params.insert(
                "IdentifierType".to_string(),
                Value::String(self.config.identifier_type.clone()),
            );
            params.insert(
                "CustomerIdentifier".to_string(),
                Value::String(self.user.user_identifier().unwrap_or_default()),
            );
            if let Some(action) = &self.user_login_action {
                if let Some(merge_customer_id) = action.merge_customer_id() {
                    params.insert("MergeCustomerId".to_string(), Value::from(merge_customer_id));
                }
                if let Some(merge_customer_guid) = action.merge_customer_guid() {
                    params.insert(
                        "MergeCustomerGUID".to_string(),
                        Value::String(merge_customer_guid),
                    );
                }
                if let Some(session_id) = action.previous_session_id() {
                    params.insert("SessionId".to_string(), Value::String(session_id));
                }
            }
            let user = Arc::clone(&self.user);
            let user_context = user.get_context(context_needs_refresh).await;
            if let Some(auth_token) = user_context.auth_token {
                params.insert("Auth".to_string(), Value::String(auth_token));
            }
            if !user_context.context.is_empty() {
                params.insert("Context".to_string(), Value::Object(user_context.context));
            }
        } else {
            path = AUTH_ANONYMOUS_PATH;
        }

        let request = SocketRequest::new(self.next_request_id(), path, Some(params), None, None);
        AuthRequest {
            request,
            is_session_auth,
        }
    }

    /// Absorb a successful auth: adopt the session, retarget the
    /// company, and discard any pending login action (the server has
    /// merged the accounts by now).
    pub fn update_with_auth_response(&mut self, session: Session) {
        self.my_id = session.customer_id();
        self.customer_target_company_id = session.company_id();
        self.session = Some(session);
        self.user_login_action = None;
    }

    /// Current session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Replace the current session; `None` drops it.
    pub fn set_session(&mut self, session: Option<Session>) {
        self.session = session;
    }

    /// Pending login action, if any.
    #[must_use]
    pub fn user_login_action(&self) -> Option<&UserLoginAction> {
        self.user_login_action.as_ref()
    }

    /// Customer id of the authenticated user, 0 before auth.
    #[must_use]
    pub fn my_id(&self) -> u64 {
        self.my_id
    }

    /// Target the issue used for contextless non-customer requests.
    pub fn set_issue_id(&mut self, issue_id: i64) {
        self.issue_id = issue_id;
    }

    /// Set or clear the admin-targeted customer.
    pub fn set_target_customer_token(&mut self, token: Option<String>) {
        self.target_customer_token = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::auth_body;
    use crate::user::StaticUser;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config() -> ChatConfig {
        ChatConfig::new("demo", "demo.example.com", "s3cret")
    }

    fn serializer_for(user: StaticUser) -> OutgoingMessageSerializer {
        OutgoingMessageSerializer::new(config(), Arc::new(user), None)
    }

    fn object(value: serde_json::Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_request_ids_increment_from_two() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let first = serializer.create_request("a", None, None);
        let second = serializer.create_request("b", None, None);
        assert_eq!(first.request_id(), 2);
        assert_eq!(second.request_id(), 3);
    }

    #[test]
    fn test_params_carry_request_uuid() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let request = serializer.create_request("a", Some(object(json!({"bar": "baz"}))), None);
        assert!(!request.request_uuid().is_empty());
        assert_eq!(
            request.params().get(RESERVED_REQUEST_ID_KEY),
            Some(&Value::String(request.request_uuid().to_string()))
        );
        assert_eq!(request.params().get("bar"), Some(&json!("baz")));
    }

    #[test]
    fn test_request_string_uses_explicit_context() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let request =
            serializer.create_request("foo", None, Some(object(json!({"alpha": "beta"}))));
        let rendered = serializer.create_request_string(&request);
        assert!(rendered.starts_with("foo|2|{\"alpha\":\"beta\"}|"));
        assert!(rendered.contains(RESERVED_REQUEST_ID_KEY));
    }

    #[test]
    fn test_default_context_is_company() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        serializer.update_with_auth_response(
            crate::session::Session::from_auth_body(&auth_body(None)).unwrap(),
        );
        let request = serializer.create_request("conversation/GetEvents", None, None);
        let rendered = serializer.create_request_string(&request);
        assert!(rendered.contains("|{\"CompanyId\":42}|"));
    }

    #[test]
    fn test_targeted_customer_switches_context_to_issue() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        serializer.set_target_customer_token(Some("crm-token".to_string()));
        serializer.set_issue_id(77);

        let request = serializer.create_request("conversation/GetEvents", None, None);
        assert!(serializer
            .create_request_string(&request)
            .contains("|{\"IssueId\":77}|"));

        // Customer endpoints keep the company context.
        let request = serializer.create_request("customer/SendTextMessage", None, None);
        assert!(serializer
            .create_request_string(&request)
            .contains("|{\"CompanyId\":0}|"));
    }

    #[test]
    fn test_binary_request_has_data_and_no_path() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let request = serializer.create_request_with_data(b"gamma".to_vec());
        assert_eq!(request.request_data(), Some(&b"gamma"[..]));
        assert_eq!(request.path(), "");
        assert_eq!(request.request_id(), 2);
    }

    #[test]
    fn test_sensitive_paths_scrub_logged_params() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let request = serializer.create_request(
            "payment/CreditCard/Update",
            Some(object(json!({"Number": "4111111111111111", "CVV": "123"}))),
            None,
        );
        assert!(request.contains_sensitive_data());
        let scrubbed = request.scrubbed_params();
        assert_eq!(scrubbed.get("Number"), Some(&json!("xxxx")));
        assert_eq!(scrubbed.get("CVV"), Some(&json!("xxx")));

        let description = request.loggable_description();
        assert!(description.contains("\"Number\":\"xxxx\""));
        assert!(description.contains("\"CVV\":\"xxx\""));
        assert!(!description.contains("4111111111111111"));
    }

    #[test]
    fn test_plain_paths_are_not_scrubbed() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let request = serializer.create_request(
            "customer/SendTextMessage",
            Some(object(json!({"Number": "5"}))),
            None,
        );
        assert!(!request.contains_sensitive_data());
        assert_eq!(request.scrubbed_params().get("Number"), Some(&json!("5")));
    }

    #[tokio::test]
    async fn test_anonymous_auth_request() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let auth = serializer.create_auth_request(false).await;
        assert_eq!(auth.request.path(), AUTH_ANONYMOUS_PATH);
        assert!(!auth.is_session_auth);
        let params = auth.request.params();
        assert_eq!(params.get("App"), Some(&json!(CLIENT_TYPE)));
        assert_eq!(params.get("CompanyMarker"), Some(&json!("demo")));
        assert_eq!(params.get("RegionCode"), Some(&json!("US")));
        assert!(params.get("CustomerIdentifier").is_none());
    }

    #[tokio::test]
    async fn test_session_auth_request_replays_session_info() {
        let mut serializer = serializer_for(StaticUser::anonymous());
        let session = crate::session::Session::from_auth_body(&auth_body(None)).unwrap();
        serializer.set_session(Some(session.clone()));
        let auth = serializer.create_auth_request(false).await;
        assert_eq!(auth.request.path(), AUTH_WITH_SESSION_PATH);
        assert!(auth.is_session_auth);
        assert_eq!(
            auth.request.params().get("SessionInfo"),
            Some(&session.session_info())
        );
    }

    #[tokio::test]
    async fn test_identified_auth_request_with_merge_and_context() {
        let previous = crate::session::Session::from_auth_body(&auth_body(None)).unwrap();
        let user = StaticUser {
            identifier: Some("user-1".to_string()),
            context: object(json!({"tier": "gold"})),
            auth_token: Some("tok-123".to_string()),
        };
        let mut serializer = OutgoingMessageSerializer::new(
            config(),
            Arc::new(user),
            Some(UserLoginAction {
                previous_session: Some(previous),
            }),
        );
        let auth = serializer.create_auth_request(false).await;
        assert_eq!(auth.request.path(), AUTH_WITH_IDENTIFIER_PATH);
        assert!(!auth.is_session_auth);
        let params = auth.request.params();
        assert_eq!(
            params.get("IdentifierType"),
            Some(&json!("DEMO_CUSTOMER_ACCOUNT_ID"))
        );
        assert_eq!(params.get("CustomerIdentifier"), Some(&json!("user-1")));
        assert_eq!(params.get("MergeCustomerId"), Some(&json!(9000)));
        assert_eq!(params.get("MergeCustomerGUID"), Some(&json!("deadbeef")));
        assert_eq!(params.get("SessionId"), Some(&json!("sess-1")));
        assert_eq!(params.get("Auth"), Some(&json!("tok-123")));
        assert_eq!(params.get("Context"), Some(&json!({"tier": "gold"})));
    }

    #[tokio::test]
    async fn test_update_with_auth_response_discards_login_action() {
        let previous = crate::session::Session::from_auth_body(&auth_body(None)).unwrap();
        let mut serializer = OutgoingMessageSerializer::new(
            config(),
            Arc::new(StaticUser::identified("user-1")),
            Some(UserLoginAction {
                previous_session: Some(previous),
            }),
        );
        assert!(serializer.user_login_action().is_some());

        let session = crate::session::Session::from_auth_body(&auth_body(Some("user-1"))).unwrap();
        serializer.update_with_auth_response(session);
        assert!(serializer.user_login_action().is_none());
        assert_eq!(serializer.my_id(), 9000);
        assert!(serializer.session().is_some());

        // The next auth resumes the session instead of re-identifying.
        let auth = serializer.create_auth_request(false).await;
        assert_eq!(auth.request.path(), AUTH_WITH_SESSION_PATH);
    }
}
