//! Shell session facade.
//!
//! The bridge drives an interactive shell the same way whichever side of the
//! SSH protocol it plays:
//!
//! - [`RemoteShell`]: connects out to an SSH server (client role)
//! - [`InboundShell`]: listens for a single inbound SSH client (server role);
//!   `connect` binds the listener and never waits on the network
//!
//! Both hand out a [`ShellChannel`] once the interactive session is open.
//!
//! # Ownership
//!
//! A facade and its channel are owned by exactly one connection. `close` is
//! idempotent on both and safe to call from cleanup paths after a partial
//! failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::config::{BridgeConfig, ShellRole};
use super::error::{AuthError, ChannelError, ConnectError};
use super::types::Credentials;

mod channel;
mod inbound;
mod remote;

pub use channel::RusshChannel;
pub use inbound::InboundShell;
pub use remote::{RemoteShell, build_client_config};

/// Terminal type requested for the pseudo-terminal
pub const PTY_TERM: &str = "xterm";

/// Initial pseudo-terminal width in columns
pub const PTY_COLUMNS: u32 = 80;

/// Initial pseudo-terminal height in rows
pub const PTY_ROWS: u32 = 24;

/// Uniform shell session interface over both SSH roles.
#[async_trait]
pub trait ShellSession: Send {
    /// Establish the underlying transport (server role: bind the listener).
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError>;

    /// Authenticate with the given credentials.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), AuthError>;

    /// Open a session channel with a pseudo-terminal and an interactive shell.
    async fn open_interactive_channel(&mut self) -> Result<Box<dyn ShellChannel>, ChannelError>;

    /// Release all transport resources. Idempotent.
    async fn close(&mut self);
}

/// Duplex byte stream of one interactive session.
///
/// Shared by reference between the two pumps of a connection, so every
/// method takes `&self`.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    /// Return up to `max_bytes` of already-received output without blocking.
    ///
    /// An empty result means no data is currently available.
    async fn read_available(&self, max_bytes: usize) -> Vec<u8>;

    /// Suspend until output may be available, for at most `interval`.
    ///
    /// The default simply sleeps; channels with readiness notification
    /// return as soon as data arrives.
    async fn wait_readable(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }

    /// Send keystrokes or input to the shell.
    async fn write(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// True once the channel is closed and all buffered output was read.
    fn is_closed(&self) -> bool;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Creates one shell facade per bridged connection.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Box<dyn ShellSession>;
}

/// Factory choosing the facade from the configured [`ShellRole`].
pub struct RoleSessionFactory {
    config: Arc<BridgeConfig>,
}

impl RoleSessionFactory {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self { config }
    }
}

impl SessionFactory for RoleSessionFactory {
    fn create(&self) -> Box<dyn ShellSession> {
        match self.config.shell_role {
            ShellRole::Client => Box::new(RemoteShell::new(
                self.config.connect_timeout,
                self.config.channel_timeout,
            )),
            ShellRole::Server => Box::new(InboundShell::new(
                self.config.host_key_path.clone(),
                self.config.connect_timeout,
                self.config.channel_timeout,
            )),
        }
    }
}
