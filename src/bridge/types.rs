//! Wire messages and core value types for the bridge.
//!
//! Every message on the WebSocket is a JSON object tagged by its `type` field:
//!
//! | `type` | Direction | Fields |
//! |--------|-----------|--------|
//! | `connect` | client → bridge | `host`, `port`, `username`, `password` |
//! | `connection` | bridge → client | `status`, optional `message` |
//! | `output` | bridge → client | `data` |
//! | `input` | client → bridge | `data` |

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use super::error::MessageError;

/// Message received from the terminal client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Request to start a shell session
    Connect(ConnectRequest),
    /// Keystrokes or commands for the shell
    Input { data: String },
    /// Any other well-formed message type; ignored by the bridge
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a raw text frame.
    ///
    /// Unknown `type` values parse successfully as [`ClientMessage::Unknown`];
    /// anything that is not a JSON object with a `type` field, or that is missing
    /// a required field of a known type, is malformed.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Malformed(e.to_string()))
    }
}

/// Fields of a `connect` message.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Accepts the port either as a JSON number or as a numeric string.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|e| serde::de::Error::custom(format!("invalid port '{}': {}", text, e))),
    }
}

/// Outcome reported in a `connection` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Success,
    Failed,
}

/// Message sent to the terminal client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// One-time lifecycle outcome notification
    Connection {
        status: ConnectionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Chunk of shell output
    Output { data: String },
}

impl ServerMessage {
    pub fn success() -> Self {
        ServerMessage::Connection {
            status: ConnectionStatus::Success,
            message: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ServerMessage::Connection {
            status: ConnectionStatus::Failed,
            message: Some(reason.into()),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }
}

/// Target and secret used to open one shell session.
///
/// Held only until authentication completes; the password never appears in
/// `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl From<ConnectRequest> for Credentials {
    fn from(request: ConnectRequest) -> Self {
        Self {
            host: request.host,
            port: request.port,
            username: request.username,
            password: request.password,
        }
    }
}

/// Lifecycle state of a bridged connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    ChannelOpening,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Authenticating => 2,
            ConnectionState::ChannelOpening => 3,
            ConnectionState::Streaming => 4,
            ConnectionState::Closing => 5,
            ConnectionState::Closed | ConnectionState::Failed => 6,
        }
    }

    /// `Closed` and `Failed` have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Transitions only move forward; no state is ever revisited.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::ChannelOpening => "channel_opening",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of a live connection kept by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    /// Remote address of the WebSocket peer, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub state: ConnectionState,
    /// When the WebSocket was accepted (RFC3339 format)
    pub started_at: String,
}
