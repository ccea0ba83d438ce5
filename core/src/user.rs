//! User Identity
//!
//! The host-side identity seam. The connection never knows how a host
//! authenticates its users; it asks a [`UserIdentity`] for the
//! identifier and for fresh auth context when building auth requests.

use async_trait::async_trait;

use crate::session::Session;
use crate::wire::JsonObject;

/// Auth context supplied by the host for an identified user.
#[derive(Clone, Debug, Default)]
pub struct UserContext {
    /// Opaque context mapping forwarded to the server.
    pub context: JsonObject,
    /// Host-issued auth token, when the host uses one.
    pub auth_token: Option<String>,
}

/// Host-provided user identity.
#[async_trait]
pub trait UserIdentity: Send + Sync {
    /// Stable identifier for the current user, `None` when anonymous.
    fn user_identifier(&self) -> Option<String>;

    /// Whether the current user is anonymous.
    fn is_anonymous(&self) -> bool {
        self.user_identifier().map_or(true, |id| id.is_empty())
    }

    /// Fetch auth context. `needs_refresh` is set when a previous
    /// attempt with cached context was rejected.
    async fn get_context(&self, needs_refresh: bool) -> UserContext;
}

/// A fixed identity, for tests and simple hosts.
#[derive(Clone, Debug, Default)]
pub struct StaticUser {
    /// Identifier, `None` for an anonymous user.
    pub identifier: Option<String>,
    /// Context returned from every fetch.
    pub context: JsonObject,
    /// Token returned from every fetch.
    pub auth_token: Option<String>,
}

impl StaticUser {
    /// An anonymous user.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An identified user with no extra context.
    #[must_use]
    pub fn identified(identifier: &str) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl UserIdentity for StaticUser {
    fn user_identifier(&self) -> Option<String> {
        self.identifier.clone()
    }

    async fn get_context(&self, _needs_refresh: bool) -> UserContext {
        UserContext {
            context: self.context.clone(),
            auth_token: self.auth_token.clone(),
        }
    }
}

/// A pending anonymous-to-identified account merge, staged when a saved
/// anonymous session is found for a now-identified user. The previous
/// session rides along so the server can merge the conversations.
#[derive(Clone, Debug, Default)]
pub struct UserLoginAction {
    /// The anonymous session being merged away.
    pub previous_session: Option<Session>,
}

impl UserLoginAction {
    /// Customer id of the session being merged.
    #[must_use]
    pub fn merge_customer_id(&self) -> Option<u64> {
        self.previous_session.as_ref().map(Session::customer_id)
    }

    /// Customer GUID of the session being merged.
    #[must_use]
    pub fn merge_customer_guid(&self) -> Option<String> {
        self.previous_session
            .as_ref()
            .and_then(|s| s.customer_guid().map(ToString::to_string))
    }

    /// Id of the session being merged.
    #[must_use]
    pub fn previous_session_id(&self) -> Option<String> {
        self.previous_session
            .as_ref()
            .map(|s| s.id().to_string())
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::auth_body;
    use crate::session::Session;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_static_user_anonymity() {
        assert!(StaticUser::anonymous().is_anonymous());
        assert!(!StaticUser::identified("user-1").is_anonymous());
        assert!(StaticUser {
            identifier: Some(String::new()),
            ..StaticUser::default()
        }
        .is_anonymous());
    }

    #[test]
    fn test_login_action_exposes_previous_session_fields() {
        let session = Session::from_auth_body(&auth_body(None)).unwrap();
        let action = UserLoginAction {
            previous_session: Some(session),
        };
        assert_eq!(action.merge_customer_id(), Some(9000));
        assert_eq!(action.merge_customer_guid(), Some("deadbeef".to_string()));
        assert_eq!(action.previous_session_id(), Some("sess-1".to_string()));
    }

    #[test]
    fn test_empty_login_action_has_no_merge_fields() {
        let action = UserLoginAction::default();
        assert_eq!(action.merge_customer_id(), None);
        assert_eq!(action.merge_customer_guid(), None);
        assert_eq!(action.previous_session_id(), None);
    }
}
