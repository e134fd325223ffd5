//! Standalone demo SSH server.
//!
//! Accepts any number of SSH clients, each on its own task, and serves a
//! minimal line-echo shell instead of a real one:
//!
//! - greets with `Welcome to the SSH server!`
//! - answers every chunk it receives with `Command received: <chunk>`
//! - on `exit` says `Goodbye!` and closes the channel
//!
//! Authentication is password-only against the fixed credentials from the
//! configuration, and only `session` channels are accepted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::{AuthPolicy, FixedCredentials};
use super::config::BridgeConfig;
use super::error::{ChannelError, ConnectError};
use super::negotiator::{SessionNegotiator, build_server_config, load_host_key};
use super::pump::PumpSettings;
use super::shell::{RusshChannel, ShellChannel};
use super::types::Credentials;

pub const WELCOME: &str = "Welcome to the SSH server!\n";
pub const GOODBYE: &str = "Goodbye!\n";
pub const EXIT_COMMAND: &str = "exit";

/// How long a client may take to open its session channel
const CHANNEL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(20);

/// Reply to one received chunk, or `None` when the client asked to leave.
pub fn reply_to(chunk: &str) -> Option<String> {
    if chunk.trim() == EXIT_COMMAND {
        None
    } else {
        Some(format!("Command received: {}\n", chunk))
    }
}

/// Serve the demo shell on an open channel until `exit` or closure.
pub async fn run_demo_shell(
    channel: &dyn ShellChannel,
    settings: PumpSettings,
) -> Result<(), ChannelError> {
    channel.write(WELCOME.as_bytes()).await?;

    loop {
        let chunk = channel.read_available(settings.read_chunk).await;
        if chunk.is_empty() {
            if channel.is_closed() {
                debug!("Demo client closed its channel");
                return Ok(());
            }
            channel.wait_readable(settings.poll_interval).await;
            continue;
        }

        let command = String::from_utf8_lossy(&chunk);
        match reply_to(&command) {
            Some(reply) => channel.write(reply.as_bytes()).await?,
            None => {
                channel.write(GOODBYE.as_bytes()).await?;
                return Ok(());
            }
        }
    }
}

/// Demo SSH server bound to one address.
pub struct DemoServer {
    addr: String,
    config: Arc<server::Config>,
    policy: Arc<dyn AuthPolicy>,
    settings: PumpSettings,
}

impl DemoServer {
    pub fn new(
        addr: impl Into<String>,
        host_key: PrivateKey,
        credentials: &Credentials,
        settings: PumpSettings,
    ) -> Self {
        let policy: Arc<dyn AuthPolicy> = Arc::new(FixedCredentials::from(credentials));
        Self {
            addr: addr.into(),
            config: build_server_config(host_key, policy.as_ref()),
            policy,
            settings,
        }
    }

    /// Load the host key and prepare the server from the bridge configuration.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, String> {
        let host_key = load_host_key(&config.host_key_path)?;
        Ok(Self::new(
            config.demo_server_addr.clone(),
            host_key,
            &config.fixed_credentials,
            config.pump_settings(),
        ))
    }

    /// Bind the configured address and accept clients until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConnectError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| ConnectError::Bind {
                address: self.addr.clone(),
                reason: e.to_string(),
            })?;
        info!("Demo SSH server listening on {}", self.addr);
        self.serve(listener, cancel).await;
        Ok(())
    }

    /// Accept clients on an already bound listener until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => {
                    info!("Demo SSH server on {} stopped", self.addr);
                    return;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!("Demo SSH client connected from {}", peer);
                    tokio::spawn(serve_client(
                        stream,
                        peer,
                        Arc::clone(&self.config),
                        Arc::clone(&self.policy),
                        self.settings,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept demo SSH client: {}", e);
                }
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<server::Config>,
    policy: Arc<dyn AuthPolicy>,
    settings: PumpSettings,
    cancel: CancellationToken,
) {
    let (negotiator, negotiation) = SessionNegotiator::new(Some(peer), policy);
    let running = match server::run_stream(config, stream, negotiator).await {
        Ok(running) => running,
        Err(e) => {
            warn!("SSH handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let session = tokio::spawn(async move {
        if let Err(e) = running.await {
            debug!("Demo SSH session with {} ended: {}", peer, e);
        }
    });

    let channel = match tokio::time::timeout(CHANNEL_ACCEPT_TIMEOUT, negotiation.channel()).await {
        Ok(Some(channel)) => RusshChannel::new(channel),
        Ok(None) => {
            debug!("{} left without opening a session channel", peer);
            session.abort();
            return;
        }
        Err(_) => {
            warn!("No session channel from {} within {:?}", peer, CHANNEL_ACCEPT_TIMEOUT);
            session.abort();
            return;
        }
    };

    tokio::select! {
        result = run_demo_shell(&channel, settings) => {
            if let Err(e) = result {
                warn!("Demo shell for {} stopped: {}", peer, e);
            }
        }
        _ = cancel.cancelled() => {}
    }

    channel.close().await;
    session.abort();
    info!("Demo SSH client {} disconnected", peer);
}
