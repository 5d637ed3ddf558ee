use serde::{Deserialize, Serialize};

/// First line sent on every admin connection, naming what the connection is for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "open", rename_all = "kebab-case")]
pub enum ChannelOpen {
    /// Long-lived control channel carrying the command protocol
    Control,

    /// Tunnel stream for one announced public request
    Tunnel {
        #[serde(rename = "endpointId")]
        endpoint_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

/// Server answer to a tunnel preamble. Raw bytes follow a successful answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelOpenResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelOpenResult {
    pub fn accepted() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// Commands sent from client to server on the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Authenticate and claim an endpoint
    Auth {
        /// Opaque parameters handed to the authenticator
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Graceful session termination
    End,

    /// Keepalive, answered with `pong`
    Ping,
}

/// Outcome of the `auth` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthResult {
    pub success: bool,
    #[serde(
        rename = "endpointId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub endpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResult {
    pub fn granted(endpoint_id: impl Into<String>) -> Self {
        Self {
            success: true,
            endpoint_id: Some(endpoint_id.into()),
            error: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            endpoint_id: None,
            error: Some(reason.into()),
        }
    }
}

/// Messages sent from server to client on the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ServerCommand {
    /// A public request is waiting for a tunnel stream tagged with `request_id`
    NewRequest {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    /// Keepalive answer
    Pong,
}

/// Anything the server writes on a control channel.
///
/// The auth result carries no `command` tag, so the two shapes are told apart
/// structurally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Command(ServerCommand),
    AuthResult(AuthResult),
}

impl ServerMessage {
    pub fn new_request(request_id: impl Into<String>) -> Self {
        ServerMessage::Command(ServerCommand::NewRequest {
            request_id: request_id.into(),
        })
    }

    pub fn pong() -> Self {
        ServerMessage::Command(ServerCommand::Pong)
    }
}

impl From<AuthResult> for ServerMessage {
    fn from(result: AuthResult) -> Self {
        ServerMessage::AuthResult(result)
    }
}
