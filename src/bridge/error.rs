//! Error taxonomy for the bridge.
//!
//! Every failure is scoped to a single connection. Errors are grouped by the
//! lifecycle stage that produces them so that the `connection: failed`
//! notification tells the client which stage went wrong:
//!
//! 1. [`ConnectError`]: the shell transport could not be established
//!    (unreachable, refused, timed out, listener bind failure).
//! 2. [`AuthError`]: credentials were rejected or authentication broke down.
//! 3. [`ChannelError`]: the interactive channel could not be opened or was
//!    used after it closed.
//! 4. [`MessageError`]: the message channel delivered something unparseable
//!    or failed underneath us.
//!
//! None of these are retried automatically.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to connect to {address}: {reason}")]
    Transport { address: String, reason: String },

    #[error("Failed to listen on {address}: {reason}")]
    Bind { address: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication failed for user '{0}'")]
    Rejected(String),

    #[error("Authentication timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    Protocol(String),

    #[error("Authentication failed: not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Unable to open SSH channel: {0}")]
    Rejected(String),

    #[error("Unable to open SSH channel: no session channel within {0:?}")]
    Timeout(Duration),

    #[error("Unable to open SSH channel: not authenticated")]
    NotAuthenticated,

    #[error("SSH channel is closed")]
    Closed,

    #[error("Failed to write to SSH channel: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid message: {0}")]
    Malformed(String),

    #[error("Message channel closed")]
    Closed,

    #[error("Message channel error: {0}")]
    Transport(String),
}

/// Terminal error of a connection.
///
/// Its `Display` output is the human-readable reason sent to the client.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Bridge is shutting down")]
    Cancelled,
}
