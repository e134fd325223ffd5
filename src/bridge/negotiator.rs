//! Session negotiation for inbound SSH clients (server role).
//!
//! One [`SessionNegotiator`] serves one inbound SSH connection and walks a
//! small state machine:
//!
//! ```text
//! AwaitingAuth --(password accepted)--> AwaitingChannel --(session channel)--> Open
//! ```
//!
//! - Password is the only authentication method offered. Each attempt is
//!   judged on its own by the [`AuthPolicy`]; there is no lockout.
//! - Only `session` channels are accepted. Other channel kinds are refused
//!   (administratively prohibited) without changing state, and so is any
//!   second session channel.
//! - Once `Open`, the channel is handed over through a one-shot and the
//!   negotiator only acknowledges PTY and shell requests.
//!
//! Progress is published on a `watch` channel so the waiting side can tell
//! "still negotiating" apart from "client went away".

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::auth::{AuthDecision, AuthPolicy};

/// Negotiation progress of one inbound SSH client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingAuth,
    AwaitingChannel,
    Open,
}

/// Load the server host key from disk.
///
/// Key generation and storage are handled outside the bridge.
pub fn load_host_key(path: &Path) -> Result<PrivateKey, String> {
    russh::keys::load_secret_key(path, None)
        .map_err(|e| format!("Failed to load host key {}: {}", path.display(), e))
}

/// Build russh server configuration offering password authentication only.
pub fn build_server_config(host_key: PrivateKey, policy: &dyn AuthPolicy) -> Arc<server::Config> {
    Arc::new(server::Config {
        methods: policy.allowed_methods(),
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        inactivity_timeout: None,
        ..Default::default()
    })
}

/// Waiting side of a negotiation.
pub struct NegotiationHandle {
    state: watch::Receiver<NegotiationState>,
    channel: oneshot::Receiver<Channel<Msg>>,
}

impl NegotiationHandle {
    /// Wait until the client authenticated.
    ///
    /// Returns `false` if the client disconnected first.
    pub async fn authenticated(&mut self) -> bool {
        self.state
            .wait_for(|state| *state != NegotiationState::AwaitingAuth)
            .await
            .is_ok()
    }

    /// Wait for the session channel.
    ///
    /// Returns `None` if the client disconnected without opening one.
    pub async fn channel(self) -> Option<Channel<Msg>> {
        self.channel.await.ok()
    }
}

/// russh server handler for one inbound SSH client.
pub struct SessionNegotiator {
    peer: Option<SocketAddr>,
    policy: Arc<dyn AuthPolicy>,
    state: watch::Sender<NegotiationState>,
    handoff: Option<oneshot::Sender<Channel<Msg>>>,
    username: Option<String>,
}

impl SessionNegotiator {
    pub fn new(peer: Option<SocketAddr>, policy: Arc<dyn AuthPolicy>) -> (Self, NegotiationHandle) {
        let (state_tx, state_rx) = watch::channel(NegotiationState::AwaitingAuth);
        let (channel_tx, channel_rx) = oneshot::channel();
        let negotiator = Self {
            peer,
            policy,
            state: state_tx,
            handoff: Some(channel_tx),
            username: None,
        };
        let handle = NegotiationHandle {
            state: state_rx,
            channel: channel_rx,
        };
        (negotiator, handle)
    }

    fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn advance(&self, next: NegotiationState) {
        debug!(peer = ?self.peer, "Negotiation {:?} -> {:?}", self.state(), next);
        self.state.send_replace(next);
    }

    /// Whether a session channel may be accepted right now.
    fn can_open_session(&self) -> bool {
        self.state() == NegotiationState::AwaitingChannel && self.handoff.is_some()
    }
}

impl server::Handler for SessionNegotiator {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.policy.evaluate(user, password) {
            AuthDecision::Accepted => {
                info!(
                    peer = ?self.peer,
                    user = %user,
                    policy = self.policy.name(),
                    "password authentication accepted"
                );
                self.username = Some(user.to_string());
                if self.state() == NegotiationState::AwaitingAuth {
                    self.advance(NegotiationState::AwaitingChannel);
                }
                Ok(Auth::Accept)
            }
            AuthDecision::Rejected => {
                warn!(
                    peer = ?self.peer,
                    user = %user,
                    policy = self.policy.name(),
                    "password authentication rejected"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: Some(self.policy.allowed_methods()),
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.can_open_session() {
            warn!(peer = ?self.peer, "refusing additional session channel");
            return Ok(false);
        }

        let Some(handoff) = self.handoff.take() else {
            return Ok(false);
        };

        if handoff.send(channel).is_err() {
            warn!(peer = ?self.peer, "no bridge waiting for the session channel");
            return Ok(false);
        }

        info!(
            peer = ?self.peer,
            user = %self.username.as_deref().unwrap_or("<unknown>"),
            "session channel opened"
        );
        self.advance(NegotiationState::Open);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            peer = ?self.peer,
            "refusing direct-tcpip channel to {}:{}",
            host_to_connect, port_to_connect
        );
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer, "PTY {} {}x{} requested", term, col_width, row_height);
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer, "shell requested");
        session.channel_success(channel)?;
        Ok(())
    }
}
