//! Inbound shell session (server role).
//!
//! The bridge listens for exactly one SSH client per connection and bridges
//! that client's session channel:
//!
//! - `connect` binds the listener (always "connected" once bound)
//! - `authenticate` accepts one socket, runs the SSH handshake and waits until
//!   the client logs in with the given credentials (the configured fixed
//!   ones, never the WebSocket client's)
//! - `open_interactive_channel` waits for the client's session channel,
//!   bounded by the channel negotiation timeout

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::auth::{AuthPolicy, FixedCredentials};
use crate::bridge::error::{AuthError, ChannelError, ConnectError};
use crate::bridge::negotiator::{
    NegotiationHandle, SessionNegotiator, build_server_config, load_host_key,
};
use crate::bridge::types::Credentials;

use super::{RusshChannel, ShellChannel, ShellSession};

/// Shell session provided by a single inbound SSH client.
pub struct InboundShell {
    host_key_path: PathBuf,
    connect_timeout: Duration,
    channel_timeout: Duration,
    address: String,
    listener: Option<TcpListener>,
    negotiation: Option<NegotiationHandle>,
    session_task: Option<JoinHandle<()>>,
}

impl InboundShell {
    pub fn new(host_key_path: PathBuf, connect_timeout: Duration, channel_timeout: Duration) -> Self {
        Self {
            host_key_path,
            connect_timeout,
            channel_timeout,
            address: String::new(),
            listener: None,
            negotiation: None,
            session_task: None,
        }
    }
}

#[async_trait]
impl ShellSession for InboundShell {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.address = format!("{}:{}", host, port);
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ConnectError::Bind {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        info!("Waiting for SSH client on {}", self.address);
        self.listener = Some(listener);
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), AuthError> {
        let listener = self.listener.take().ok_or(AuthError::NotConnected)?;

        let policy: Arc<dyn AuthPolicy> = Arc::new(FixedCredentials::from(credentials));
        let host_key = load_host_key(&self.host_key_path).map_err(AuthError::Protocol)?;
        let config = build_server_config(host_key, policy.as_ref());

        // Only one client is ever accepted; the listener is dropped afterwards
        let (stream, peer) = tokio::time::timeout(self.connect_timeout, listener.accept())
            .await
            .map_err(|_| AuthError::Timeout(self.connect_timeout))?
            .map_err(|e| AuthError::Protocol(format!("Failed to accept SSH client: {}", e)))?;
        drop(listener);
        info!("SSH client {} connected on {}", peer, self.address);

        let (negotiator, mut negotiation) = SessionNegotiator::new(Some(peer), policy);
        let running = server::run_stream(config, stream, negotiator)
            .await
            .map_err(|e| AuthError::Protocol(format!("SSH handshake failed: {}", e)))?;

        self.session_task = Some(tokio::spawn(async move {
            if let Err(e) = running.await {
                debug!("SSH session with {} ended: {}", peer, e);
            }
        }));

        let accepted = tokio::time::timeout(self.connect_timeout, negotiation.authenticated())
            .await
            .map_err(|_| AuthError::Timeout(self.connect_timeout))?;

        if !accepted {
            return Err(AuthError::Protocol(
                "client disconnected before authenticating".to_string(),
            ));
        }

        self.negotiation = Some(negotiation);
        Ok(())
    }

    async fn open_interactive_channel(&mut self) -> Result<Box<dyn ShellChannel>, ChannelError> {
        let negotiation = self
            .negotiation
            .take()
            .ok_or(ChannelError::NotAuthenticated)?;

        let channel = tokio::time::timeout(self.channel_timeout, negotiation.channel())
            .await
            .map_err(|_| ChannelError::Timeout(self.channel_timeout))?
            .ok_or_else(|| {
                ChannelError::Rejected(
                    "client disconnected before opening a session channel".to_string(),
                )
            })?;

        info!("Inbound session channel opened on {}", self.address);
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn close(&mut self) {
        self.listener = None;
        self.negotiation = None;
        if let Some(task) = self.session_task.take() {
            task.abort();
            info!("Closed inbound SSH session on {}", self.address);
        }
    }
}
