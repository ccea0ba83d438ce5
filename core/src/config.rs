//! Client Configuration
//!
//! Immutable configuration for a chat connection. A [`ChatConfig`] is
//! created once by the host application and handed to the connection;
//! nothing in this crate reads global state.

use serde::{Deserialize, Serialize};

/// Client type reported to the server on every connection.
pub const CLIENT_TYPE: &str = "consumer-sdk";

/// Client version reported to the server on every connection.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying [`CLIENT_TYPE`].
pub const CLIENT_TYPE_HEADER: &str = "X-Client-Type";

/// Header carrying [`CLIENT_VERSION`].
pub const CLIENT_VERSION_HEADER: &str = "X-Client-Version";

/// Header carrying the client secret.
pub const CLIENT_SECRET_HEADER: &str = "X-Client-Secret";

/// Immutable connection configuration.
///
/// `identifier_type` defaults to `{APP_ID}_CUSTOMER_ACCOUNT_ID` with the
/// app id uppercased; hosts with a custom identifier scheme override it
/// with [`ChatConfig::with_identifier_type`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Application identifier, also sent as the company marker during auth.
    pub app_id: String,
    /// API host name, e.g. `demo.example.com`.
    pub api_host_name: String,
    /// Secret identifying this client build to the server.
    pub client_secret: String,
    /// Region code sent during auth.
    pub region_code: String,
    /// Identifier type sent when authenticating an identified customer.
    pub identifier_type: String,
}

impl ChatConfig {
    /// Create a configuration with the default region (`US`) and the
    /// default identifier type derived from `app_id`.
    #[must_use]
    pub fn new(app_id: &str, api_host_name: &str, client_secret: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            api_host_name: api_host_name.to_string(),
            client_secret: client_secret.to_string(),
            region_code: "US".to_string(),
            identifier_type: format!("{}_CUSTOMER_ACCOUNT_ID", app_id.to_uppercase()),
        }
    }

    /// Override the region code.
    #[must_use]
    pub fn with_region_code(mut self, region_code: &str) -> Self {
        self.region_code = region_code.to_string();
        self
    }

    /// Override the identifier type.
    #[must_use]
    pub fn with_identifier_type(mut self, identifier_type: &str) -> Self {
        self.identifier_type = identifier_type.to_string();
        self
    }

    /// Build the connection request for this configuration: the socket
    /// URL plus the client identification headers.
    #[must_use]
    pub fn connection_request(&self) -> ConnectionRequest {
        ConnectionRequest {
            url: format!("wss://{}/api/websocket", self.api_host_name),
            headers: vec![
                (CLIENT_TYPE_HEADER.to_string(), CLIENT_TYPE.to_string()),
                (CLIENT_VERSION_HEADER.to_string(), CLIENT_VERSION.to_string()),
                (CLIENT_SECRET_HEADER.to_string(), self.client_secret.clone()),
            ],
        }
    }
}

/// Everything a transport needs to open a connection.
#[derive(Clone, Debug)]
pub struct ConnectionRequest {
    /// Socket URL.
    pub url: String,
    /// Headers sent with the connection handshake.
    pub headers: Vec<(String, String)>,
}
