//! Sessions
//!
//! The authenticated session value and its persistence.
//!
//! A [`Session`] is produced from the body of a successful auth
//! response and retains the complete `SessionInfo` payload verbatim:
//! resuming a session replays that payload back to the server, so no
//! field may be dropped in translation. [`SavedSessionManager`]
//! persists the most recent session through a [`SecureStore`].

use std::sync::Arc;

use serde_json::Value;

use crate::storage::SecureStore;
use crate::wire::JsonObject;

/// Store key under which the session is persisted.
pub const SESSION_STORAGE_KEY: &str = "chatwire.session";

/// An authenticated session.
#[derive(Clone, Debug)]
pub struct Session {
    id: String,
    token: String,
    authenticated_time_micros: Option<u64>,
    customer_primary_identifier: Option<String>,
    customer_id: u64,
    customer_guid: Option<String>,
    company_id: i64,
    info: JsonObject,
    full_info: Vec<u8>,
}

impl PartialEq for Session {
    /// Two sessions are equal when their serialized `SessionInfo`
    /// payloads are byte-identical.
    fn eq(&self, other: &Self) -> bool {
        self.full_info == other.full_info
    }
}

impl Eq for Session {}

impl Session {
    /// Build a session from an auth response body.
    ///
    /// Returns `None` (with a log) when required fields are missing:
    /// `SessionInfo.Customer.CustomerId`, `SessionInfo.Company.CompanyId`,
    /// and `SessionInfo.SessionAuth.SessionSecret`.
    #[must_use]
    pub fn from_auth_body(body: &JsonObject) -> Option<Self> {
        let Some(info) = body.get("SessionInfo").and_then(Value::as_object) else {
            tracing::warn!("auth body has no SessionInfo");
            return None;
        };

        let customer = info.get("Customer").and_then(Value::as_object);
        let Some(customer_id) = customer
            .and_then(|c| c.get("CustomerId"))
            .and_then(Value::as_u64)
        else {
            tracing::warn!("session info missing customer id");
            return None;
        };
        let customer_primary_identifier = customer
            .and_then(|c| c.get("PrimaryIdentifier"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        let customer_guid = customer
            .and_then(|c| c.get("CustomerGUID"))
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let Some(company_id) = info
            .get("Company")
            .and_then(Value::as_object)
            .and_then(|c| c.get("CompanyId"))
            .and_then(Value::as_i64)
        else {
            tracing::warn!("session info missing company id");
            return None;
        };

        let auth = info.get("SessionAuth").and_then(Value::as_object);
        let Some(token) = auth
            .and_then(|a| a.get("SessionSecret"))
            .and_then(Value::as_str)
        else {
            tracing::warn!("session info missing session secret");
            return None;
        };
        let authenticated_time_micros = auth
            .and_then(|a| a.get("SessionTime"))
            .and_then(Value::as_u64);

        let id = info
            .get("SessionId")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let full_info = serde_json::to_vec(&Value::Object(info.clone())).ok()?;

        Some(Self {
            id,
            token: token.to_string(),
            authenticated_time_micros,
            customer_primary_identifier,
            customer_id,
            customer_guid,
            company_id,
            info: info.clone(),
            full_info,
        })
    }

    /// Build a session from persisted bytes (the wrapped auth body).
    #[must_use]
    pub fn from_json_bytes(bytes: &[u8]) -> Option<Self> {
        let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(bytes) else {
            tracing::warn!("persisted session is not a JSON object");
            return None;
        };
        Self::from_auth_body(&body)
    }

    /// Session id, empty when the server supplied none.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session secret.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Authentication time in microseconds, when reported.
    #[must_use]
    pub fn authenticated_time_micros(&self) -> Option<u64> {
        self.authenticated_time_micros
    }

    /// Customer primary identifier; absent for anonymous sessions.
    #[must_use]
    pub fn customer_primary_identifier(&self) -> Option<&str> {
        self.customer_primary_identifier.as_deref()
    }

    /// Numeric customer id.
    #[must_use]
    pub fn customer_id(&self) -> u64 {
        self.customer_id
    }

    /// Customer GUID, when reported.
    #[must_use]
    pub fn customer_guid(&self) -> Option<&str> {
        self.customer_guid.as_deref()
    }

    /// Company id.
    #[must_use]
    pub fn company_id(&self) -> i64 {
        self.company_id
    }

    /// Whether this session belongs to an anonymous customer.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.customer_primary_identifier.is_none()
    }

    /// Whether this session belongs to the given user identifier: true
    /// when both sides are absent, or both present and equal.
    #[must_use]
    pub fn matches_identifier(&self, identifier: Option<&str>) -> bool {
        let identifier = identifier.filter(|s| !s.is_empty());
        self.customer_primary_identifier.as_deref() == identifier
    }

    /// The complete `SessionInfo` payload, replayed on session resume.
    #[must_use]
    pub fn session_info(&self) -> Value {
        Value::Object(self.info.clone())
    }

    /// Serialize for persistence, in the shape of the auth body.
    #[must_use]
    pub fn to_persisted_bytes(&self) -> Vec<u8> {
        let mut body = JsonObject::new();
        body.insert("SessionInfo".to_string(), Value::Object(self.info.clone()));
        serde_json::to_vec(&Value::Object(body)).unwrap_or_default()
    }
}

/// Collaborator notified when the persisted session is cleared, so a
/// push-notification device association can be torn down with it.
pub trait PushRegistration: Send + Sync {
    /// Drop the device's association with the cleared session.
    fn clear_device_association(&self);
}

/// Persists the most recent session.
///
/// Storage failures are logged and swallowed: losing a saved session
/// degrades to a fresh auth, which is always recoverable.
pub struct SavedSessionManager {
    store: Arc<dyn SecureStore>,
    push: Option<Arc<dyn PushRegistration>>,
}

impl SavedSessionManager {
    /// Create a manager over a store.
    #[must_use]
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self { store, push: None }
    }

    /// Attach a push-registration collaborator.
    #[must_use]
    pub fn with_push_registration(mut self, push: Arc<dyn PushRegistration>) -> Self {
        self.push = Some(push);
        self
    }

    /// Persist `session`, or delete the persisted one when `None`.
    pub fn save(&self, session: Option<&Session>) {
        let result = match session {
            Some(session) => self
                .store
                .store(SESSION_STORAGE_KEY, &session.to_persisted_bytes()),
            None => self.store.remove(SESSION_STORAGE_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist session");
        }
    }

    /// Load the persisted session, if any.
    #[must_use]
    pub fn get_session(&self) -> Option<Session> {
        match self.store.retrieve(SESSION_STORAGE_KEY) {
            Ok(Some(bytes)) => Session::from_json_bytes(&bytes),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted session");
                None
            }
        }
    }

    /// Delete the persisted session and tear down any push association.
    pub fn clear_session(&self) {
        self.save(None);
        if let Some(push) = &self.push {
            push.clear_device_association();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(crate) fn auth_body(identifier: Option<&str>) -> JsonObject {
        let mut info = json!({
            "SessionId": "sess-1",
            "Customer": {
                "CustomerId": 9000,
                "CustomerGUID": "deadbeef"
            },
            "Company": {"CompanyId": 42},
            "SessionAuth": {
                "SessionTime": 1_515_112_274_532_741_u64,
                "SessionSecret": "secret"
            }
        });
        if let Some(identifier) = identifier {
            info["Customer"]["PrimaryIdentifier"] = json!(identifier);
        }
        let mut body = JsonObject::new();
        body.insert("SessionInfo".to_string(), info);
        body
    }

    #[test]
    fn test_session_fields_from_auth_body() {
        let session = Session::from_auth_body(&auth_body(Some("user-1"))).unwrap();
        assert_eq!(session.id(), "sess-1");
        assert_eq!(session.token(), "secret");
        assert_eq!(session.authenticated_time_micros(), Some(1_515_112_274_532_741));
        assert_eq!(session.customer_id(), 9000);
        assert_eq!(session.customer_guid(), Some("deadbeef"));
        assert_eq!(session.company_id(), 42);
        assert_eq!(session.customer_primary_identifier(), Some("user-1"));
        assert!(!session.is_anonymous());
    }

    #[test]
    fn test_empty_identifier_means_anonymous() {
        let session = Session::from_auth_body(&auth_body(Some(""))).unwrap();
        assert!(session.is_anonymous());
        assert_eq!(session.customer_primary_identifier(), None);
        let session = Session::from_auth_body(&auth_body(None)).unwrap();
        assert!(session.is_anonymous());
    }

    #[test]
    fn test_matches_identifier() {
        let anonymous = Session::from_auth_body(&auth_body(None)).unwrap();
        assert!(anonymous.matches_identifier(None));
        assert!(anonymous.matches_identifier(Some("")));
        assert!(!anonymous.matches_identifier(Some("user-1")));

        let identified = Session::from_auth_body(&auth_body(Some("user-1"))).unwrap();
        assert!(identified.matches_identifier(Some("user-1")));
        assert!(!identified.matches_identifier(Some("user-2")));
        assert!(!identified.matches_identifier(None));
    }

    #[test]
    fn test_missing_required_fields_rejected() {
        let mut body = JsonObject::new();
        body.insert("SessionInfo".to_string(), json!({"Company": {"CompanyId": 1}}));
        assert!(Session::from_auth_body(&body).is_none());
        assert!(Session::from_json_bytes(b"not json").is_none());
    }

    #[test]
    fn test_persistence_roundtrip_preserves_equality() {
        let session = Session::from_auth_body(&auth_body(Some("user-1"))).unwrap();
        let manager = SavedSessionManager::new(Arc::new(MemoryStore::new()));
        manager.save(Some(&session));
        let loaded = manager.get_session().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.token(), "secret");
    }

    #[test]
    fn test_get_session_when_nothing_saved() {
        let manager = SavedSessionManager::new(Arc::new(MemoryStore::new()));
        assert!(manager.get_session().is_none());
    }

    #[test]
    fn test_clear_session_removes_and_notifies_push() {
        struct Recorder(AtomicBool);
        impl PushRegistration for Recorder {
            fn clear_device_association(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(Recorder(AtomicBool::new(false)));
        let session = Session::from_auth_body(&auth_body(None)).unwrap();
        let manager = SavedSessionManager::new(Arc::new(MemoryStore::new()))
            .with_push_registration(Arc::clone(&recorder) as Arc<dyn PushRegistration>);
        manager.save(Some(&session));
        manager.clear_session();
        assert!(manager.get_session().is_none());
        assert!(recorder.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_corrupt_persisted_session_loads_as_none() {
        let store = Arc::new(MemoryStore::new());
        store.store(SESSION_STORAGE_KEY, b"garbage").unwrap();
        let manager = SavedSessionManager::new(store);
        assert!(manager.get_session().is_none());
    }
}
