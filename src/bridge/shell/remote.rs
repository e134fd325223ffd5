//! Outbound shell session (client role).
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: Build the russh client configuration with
//!    keepalive settings. Streaming has no inactivity timeout.
//!
//! 2. **Connection Establishment**: Establish the TCP connection and SSH
//!    handshake, bounded by the connect timeout.
//!
//! 3. **Authentication**: Password authentication only, bounded by the
//!    connect timeout. A rejected password is not retried.
//!
//! 4. **Interactive Channel**: Open a session channel, request a PTY and an
//!    interactive shell, bounded by the channel negotiation timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{Disconnect, client};
use tracing::{debug, info, warn};

use crate::bridge::error::{AuthError, ChannelError, ConnectError};
use crate::bridge::session::BridgeClientHandler;
use crate::bridge::types::Credentials;

use super::{PTY_COLUMNS, PTY_ROWS, PTY_TERM, RusshChannel, ShellChannel, ShellSession};

/// Build russh client configuration.
///
/// Creates an `Arc<client::Config>` with:
/// - No inactivity timeout (an interactive shell may sit idle indefinitely)
/// - Keepalive interval of 30 seconds with max 3 keepalives
pub fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Shell session reached by connecting out to an SSH server.
pub struct RemoteShell {
    connect_timeout: Duration,
    channel_timeout: Duration,
    address: String,
    handle: Option<client::Handle<BridgeClientHandler>>,
    authenticated: bool,
}

impl RemoteShell {
    pub fn new(connect_timeout: Duration, channel_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            channel_timeout,
            address: String::new(),
            handle: None,
            authenticated: false,
        }
    }
}

#[async_trait]
impl ShellSession for RemoteShell {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.address = format!("{}:{}", host, port);
        info!("Connecting to SSH server {}", self.address);

        let config = build_client_config();
        let handler = BridgeClientHandler::new(self.address.clone());
        let connect_future = client::connect(config, (host, port), handler);

        let handle = tokio::time::timeout(self.connect_timeout, connect_future)
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))?
            .map_err(|e| ConnectError::Transport {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), AuthError> {
        let handle = self.handle.as_mut().ok_or(AuthError::NotConnected)?;

        let auth_future = handle.authenticate_password(
            credentials.username.clone(),
            credentials.password.clone(),
        );
        let result = tokio::time::timeout(self.connect_timeout, auth_future)
            .await
            .map_err(|_| AuthError::Timeout(self.connect_timeout))?
            .map_err(|e| AuthError::Protocol(e.to_string()))?;

        if !result.success() {
            warn!(
                "Password authentication rejected for {}@{}",
                credentials.username, self.address
            );
            return Err(AuthError::Rejected(credentials.username.clone()));
        }

        debug!("Authenticated {}@{}", credentials.username, self.address);
        self.authenticated = true;
        Ok(())
    }

    async fn open_interactive_channel(&mut self) -> Result<Box<dyn ShellChannel>, ChannelError> {
        let handle = match self.handle.as_ref() {
            Some(handle) if self.authenticated => handle,
            _ => return Err(ChannelError::NotAuthenticated),
        };

        let negotiate = async {
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|e| ChannelError::Rejected(e.to_string()))?;

            channel
                .request_pty(true, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
                .await
                .map_err(|e| ChannelError::Rejected(format!("PTY request failed: {}", e)))?;

            channel
                .request_shell(true)
                .await
                .map_err(|e| ChannelError::Rejected(format!("Shell request failed: {}", e)))?;

            Ok::<_, ChannelError>(channel)
        };

        let channel = tokio::time::timeout(self.channel_timeout, negotiate)
            .await
            .map_err(|_| ChannelError::Timeout(self.channel_timeout))??;

        info!("Interactive shell opened on {}", self.address);
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn close(&mut self) {
        self.authenticated = false;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "Session closed by bridge", "en")
                .await
            {
                debug!("Disconnect from {} failed: {}", self.address, e);
            }
            info!("Disconnected from SSH server {}", self.address);
        }
    }
}
