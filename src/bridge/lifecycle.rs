//! Per-connection lifecycle state machine.
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> ChannelOpening -> Streaming -> Closing -> Closed
//!   \________\______________\_________________\___________________________/-> Failed
//! ```
//!
//! Client-visible contract:
//!
//! - Exactly one `connection` notification per connection. `success` is sent
//!   on entering Streaming, before any output is forwarded. `failed` is sent
//!   for any failure before that point, and nothing follows it.
//! - Once streaming, failures end the connection with a bare close.
//! - Closure of the message channel before streaming ends the connection
//!   without any notification, even while a setup step is still running.
//!   Input sent during setup is kept and forwarded once streaming starts.
//!
//! Every path goes through Closing, which releases the channel, then the
//! shell session, then the outbound message channel. Release is best-effort
//! and never prevents reaching the terminal state.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::BridgeConfig;
use super::error::{BridgeError, MessageError};
use super::pump::{PumpExit, run_pumps};
use super::registry::ConnectionRegistry;
use super::shell::{ShellChannel, ShellSession};
use super::transport::{BufferedSource, MessageSink, MessageSource};
use super::types::{ClientMessage, ConnectRequest, ConnectionInfo, ConnectionState, ServerMessage};

/// Run a lifecycle step unless the connection is cancelled first.
async fn cancellable<T, E>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T, E>>,
) -> Result<T, BridgeError>
where
    E: Into<BridgeError>,
{
    tokio::select! {
        result = step => result.map_err(Into::into),
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
    }
}

/// Run a setup step while watching for the client leaving.
///
/// Messages that arrive meanwhile stay in `source` for the input pump.
async fn setup_step<T, E>(
    cancel: &CancellationToken,
    source: &mut BufferedSource<'_>,
    step: impl Future<Output = Result<T, E>>,
) -> Result<T, BridgeError>
where
    E: Into<BridgeError>,
{
    tokio::select! {
        result = step => result.map_err(Into::into),
        end = source.until_closed() => Err(end.into()),
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
    }
}

/// One client-to-shell bridging session.
pub struct Connection {
    id: String,
    peer: Option<String>,
    state: ConnectionState,
    config: Arc<BridgeConfig>,
    shell: Box<dyn ShellSession>,
    channel: Option<Box<dyn ShellChannel>>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    /// Set once the single `connection` notification went out
    notified: bool,
    last_error: Option<String>,
}

impl Connection {
    /// Create a connection in `Idle` and register it.
    pub fn new(
        config: Arc<BridgeConfig>,
        shell: Box<dyn ShellSession>,
        registry: Arc<ConnectionRegistry>,
        peer: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let cancel = registry.register(ConnectionInfo {
            connection_id: id.clone(),
            peer: peer.clone(),
            state: ConnectionState::Idle,
            started_at: chrono::Utc::now().to_rfc3339(),
        });

        Self {
            id,
            peer,
            state: ConnectionState::Idle,
            config,
            shell,
            channel: None,
            registry,
            cancel,
            notified: false,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reason the connection ended abnormally, if it did.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        if !self.state.can_transition_to(next) {
            warn!(
                connection_id = %self.id,
                "Ignoring invalid transition {} -> {}", self.state, next
            );
            return;
        }
        debug!(connection_id = %self.id, "State {} -> {}", self.state, next);
        self.state = next;
        self.registry.update_state(&self.id, next);
    }

    /// Drive the connection to a terminal state and return it.
    ///
    /// A connection runs once; calling this again returns the terminal state.
    pub async fn run(
        &mut self,
        source: &mut dyn MessageSource,
        sink: &mut dyn MessageSink,
    ) -> ConnectionState {
        if self.state != ConnectionState::Idle {
            return self.state;
        }
        info!(connection_id = %self.id, peer = ?self.peer, "Connection opened");

        let terminal = match self.drive(source, sink).await {
            Ok(()) => ConnectionState::Closed,
            Err(e) => {
                warn!(connection_id = %self.id, "Connection failed in {}: {}", self.state, e);
                let reason = e.to_string();
                self.notify(sink, ServerMessage::failed(reason.clone())).await;
                self.last_error = Some(reason);
                ConnectionState::Failed
            }
        };

        self.release(sink).await;
        self.transition(terminal);
        self.registry.unregister(&self.id);
        info!(connection_id = %self.id, "Connection {}", self.state);
        self.state
    }

    /// Send the one-time `connection` notification.
    async fn notify(&mut self, sink: &mut dyn MessageSink, message: ServerMessage) -> bool {
        if self.notified {
            return false;
        }
        self.notified = true;
        match sink.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(connection_id = %self.id, "Status notification not delivered: {}", e);
                false
            }
        }
    }

    /// `Ok` means a normal closure, `Err` a failure before streaming.
    async fn drive(
        &mut self,
        source: &mut dyn MessageSource,
        sink: &mut dyn MessageSink,
    ) -> Result<(), BridgeError> {
        let Some(request) = self.await_connect(source).await? else {
            debug!(connection_id = %self.id, "Client left before connecting");
            return Ok(());
        };

        let mut source = BufferedSource::new(source);
        let channel = match self.open_shell(&mut source, request).await {
            Ok(channel) => channel,
            Err(BridgeError::Message(MessageError::Closed)) => {
                info!(connection_id = %self.id, "Client left while {}", self.state);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.channel = Some(channel);

        self.transition(ConnectionState::Streaming);
        if !self.notify(sink, ServerMessage::success()).await {
            return Ok(());
        }
        info!(connection_id = %self.id, "Streaming");

        let Some(channel) = self.channel.as_deref() else {
            return Ok(());
        };
        let exit = run_pumps(
            channel,
            &mut source,
            sink,
            self.config.pump_settings(),
            &self.cancel,
        )
        .await;

        match exit {
            PumpExit::ShellClosed => info!(connection_id = %self.id, "Shell closed"),
            PumpExit::ClientClosed => info!(connection_id = %self.id, "Client disconnected"),
            PumpExit::Cancelled => info!(connection_id = %self.id, "Streaming cancelled"),
            PumpExit::Failed(e) => {
                warn!(connection_id = %self.id, "Streaming stopped: {}", e);
                self.last_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// Connect, authenticate and open the interactive channel.
    async fn open_shell(
        &mut self,
        source: &mut BufferedSource<'_>,
        request: ConnectRequest,
    ) -> Result<Box<dyn ShellChannel>, BridgeError> {
        let credentials = self.config.resolve_credentials(request);

        self.transition(ConnectionState::Connecting);
        info!(
            connection_id = %self.id,
            "Opening shell session on {}:{}", credentials.host, credentials.port
        );
        setup_step(
            &self.cancel,
            source,
            self.shell.connect(&credentials.host, credentials.port),
        )
        .await?;

        self.transition(ConnectionState::Authenticating);
        setup_step(&self.cancel, source, self.shell.authenticate(&credentials)).await?;
        drop(credentials);

        self.transition(ConnectionState::ChannelOpening);
        setup_step(&self.cancel, source, self.shell.open_interactive_channel()).await
    }

    /// Wait in `Idle` for the `connect` message.
    ///
    /// Well-formed messages of any other type are ignored.
    async fn await_connect(
        &mut self,
        source: &mut dyn MessageSource,
    ) -> Result<Option<ConnectRequest>, BridgeError> {
        loop {
            let raw = match cancellable(&self.cancel, source.next_message()).await {
                Ok(Some(raw)) => raw,
                Ok(None) | Err(BridgeError::Message(MessageError::Closed)) => return Ok(None),
                Err(e) => return Err(e),
            };

            match ClientMessage::parse(&raw)? {
                ClientMessage::Connect(request) => return Ok(Some(request)),
                other => {
                    debug!(connection_id = %self.id, "Ignoring {:?} before connect", other);
                }
            }
        }
    }

    /// Closing: release the channel, then the session, then the client side.
    async fn release(&mut self, sink: &mut dyn MessageSink) {
        self.transition(ConnectionState::Closing);
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.shell.close().await;
        sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bridge::config::ShellRole;
    use crate::bridge::error::MessageError;
    use crate::bridge::testing::{FakeChannel, FakeSession, Stage, message_pair};
    use crate::bridge::types::ConnectionStatus;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const CONNECT: &str = r#"{"type":"connect","host":"h","port":22,"username":"u","password":"p"}"#;

    fn config() -> Arc<BridgeConfig> {
        Arc::new(BridgeConfig {
            poll_interval: Duration::from_millis(5),
            ..BridgeConfig::default()
        })
    }

    struct Harness {
        client_tx: mpsc::UnboundedSender<Result<String, MessageError>>,
        client_rx: mpsc::UnboundedReceiver<ServerMessage>,
        registry: Arc<ConnectionRegistry>,
        connection_id: String,
        task: JoinHandle<ConnectionState>,
    }

    impl Harness {
        fn start(config: Arc<BridgeConfig>, session: FakeSession) -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let (source, client_tx, sink, client_rx) = message_pair();
            let connection = Connection::new(
                config,
                Box::new(session),
                Arc::clone(&registry),
                Some("127.0.0.1:40000".to_string()),
            );
            let connection_id = connection.id().to_string();
            let task = tokio::spawn(async move {
                let mut connection = connection;
                let mut source = source;
                let mut sink = sink;
                connection.run(&mut source, &mut sink).await
            });
            Self {
                client_tx,
                client_rx,
                registry,
                connection_id,
                task,
            }
        }

        fn send(&self, text: &str) {
            self.client_tx.send(Ok(text.to_string())).unwrap();
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            tokio::time::timeout(Duration::from_secs(2), self.client_rx.recv())
                .await
                .expect("message within timeout")
        }

        /// Wait for the connection to end on its own, collecting everything it
        /// still sent. The client side stays open until then.
        async fn finish(self) -> (ConnectionState, Vec<ServerMessage>) {
            let Harness {
                client_tx,
                mut client_rx,
                task,
                ..
            } = self;
            let state = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("connection ends")
                .unwrap();
            drop(client_tx);
            let mut rest = Vec::new();
            while let Some(msg) = client_rx.recv().await {
                rest.push(msg);
            }
            (state, rest)
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn failed_reason(msg: &ServerMessage) -> &str {
        match msg {
            ServerMessage::Connection {
                status: ConnectionStatus::Failed,
                message: Some(reason),
            } => reason,
            other => panic!("expected failed notification, got {:?}", other),
        }
    }

    mod happy_path {
        use super::*;

        #[tokio::test]
        async fn test_success_then_output_and_input() {
            let channel = FakeChannel::new();
            channel.push_output(b"Welcome\r\n");
            let session = FakeSession::new(channel.clone());
            let mut harness = Harness::start(config(), session.clone());

            harness.send(CONNECT);
            harness.send(r#"{"type":"input","data":"ls\r"}"#);

            assert_eq!(harness.recv().await, Some(ServerMessage::success()));
            assert_eq!(
                harness.recv().await,
                Some(ServerMessage::output("Welcome\r\n"))
            );

            wait_until(|| channel.written() == vec![b"ls\r".to_vec()]).await;
            assert_eq!(
                harness.registry.get(&harness.connection_id).unwrap().state,
                ConnectionState::Streaming
            );

            // Client disconnects
            let Harness {
                client_tx,
                registry,
                task,
                ..
            } = harness;
            drop(client_tx);
            let state = task.await.unwrap();

            assert_eq!(state, ConnectionState::Closed);
            assert_eq!(
                session.calls(),
                vec!["connect h:22", "authenticate u", "open_channel", "close"]
            );
            assert_eq!(channel.close_calls(), 1);
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn test_output_order_preserved() {
            let channel = FakeChannel::new();
            let session = FakeSession::new(channel.clone());
            let mut harness = Harness::start(config(), session);

            harness.send(CONNECT);
            assert_eq!(harness.recv().await, Some(ServerMessage::success()));

            for part in ["one ", "two ", "three"] {
                channel.push_output(part.as_bytes());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            channel.finish();

            let (state, rest) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            let text: String = rest
                .into_iter()
                .map(|msg| match msg {
                    ServerMessage::Output { data } => data,
                    other => panic!("unexpected message: {:?}", other),
                })
                .collect();
            assert_eq!(text, "one two three");
        }

        #[tokio::test]
        async fn test_fixed_credentials_override_connect_fields() {
            let channel = FakeChannel::new();
            channel.finish();
            let session = FakeSession::new(channel);
            let config = Arc::new(BridgeConfig {
                use_client_credentials: false,
                ..BridgeConfig::default()
            });
            let harness = Harness::start(config, session.clone());

            harness.send(CONNECT);
            let (state, messages) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert_eq!(messages, vec![ServerMessage::success()]);
            assert_eq!(session.calls()[0], "connect localhost:2222");
            assert_eq!(session.calls()[1], "authenticate testuser");
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn test_connect_failure_notified_once() {
            let session = FakeSession::failing_at(FakeChannel::new(), Stage::Connect);
            let harness = Harness::start(config(), session.clone());

            harness.send(CONNECT);
            let (state, messages) = harness.finish().await;
            assert_eq!(state, ConnectionState::Failed);
            assert_eq!(messages.len(), 1);
            assert_eq!(
                failed_reason(&messages[0]),
                "Failed to connect to h:22: Connection refused"
            );
            assert_eq!(session.calls(), vec!["connect h:22", "close"]);
        }

        #[tokio::test]
        async fn test_auth_failure_sends_exactly_one_failed() {
            let channel = FakeChannel::new();
            channel.push_output(b"never forwarded");
            let session = FakeSession::failing_at(channel.clone(), Stage::Authenticate);
            let harness = Harness::start(config(), session.clone());

            harness.send(CONNECT);
            harness.send(r#"{"type":"input","data":"ignored"}"#);
            let (state, messages) = harness.finish().await;

            assert_eq!(state, ConnectionState::Failed);
            assert_eq!(messages.len(), 1);
            assert_eq!(failed_reason(&messages[0]), "Authentication failed for user 'u'");
            assert!(channel.written().is_empty());
            assert_eq!(channel.close_calls(), 0);
            assert_eq!(session.calls().last().map(String::as_str), Some("close"));
        }

        #[tokio::test]
        async fn test_channel_rejection_distinct_from_auth_failure() {
            let session = FakeSession::failing_at(FakeChannel::new(), Stage::OpenChannel);
            let harness = Harness::start(config(), session);

            harness.send(CONNECT);
            let (state, messages) = harness.finish().await;

            assert_eq!(state, ConnectionState::Failed);
            assert_eq!(messages.len(), 1);
            let reason = failed_reason(&messages[0]);
            assert!(reason.starts_with("Unable to open SSH channel"));
            assert!(!reason.starts_with("Authentication failed"));
        }

        #[tokio::test]
        async fn test_malformed_message_in_idle_fails() {
            let session = FakeSession::new(FakeChannel::new());
            let harness = Harness::start(config(), session.clone());

            harness.send("this is not json");
            let (state, messages) = harness.finish().await;

            assert_eq!(state, ConnectionState::Failed);
            assert_eq!(messages.len(), 1);
            assert!(failed_reason(&messages[0]).starts_with("Invalid message"));
            assert_eq!(session.calls(), vec!["close"]);
        }

        #[tokio::test]
        async fn test_cancel_before_connect_fails() {
            let session = FakeSession::new(FakeChannel::new());
            let harness = Harness::start(config(), session);
            harness.registry.cancel_all();

            let (state, messages) = harness.finish().await;
            assert_eq!(state, ConnectionState::Failed);
            assert_eq!(failed_reason(&messages[0]), "Bridge is shutting down");
        }
    }

    mod idle {
        use super::*;

        #[tokio::test]
        async fn test_last_error_kept_after_run() {
            let registry = Arc::new(ConnectionRegistry::new());
            let (mut source, client_tx, mut sink, _client_rx) = message_pair();
            let mut connection = Connection::new(
                config(),
                Box::new(FakeSession::new(FakeChannel::new())),
                Arc::clone(&registry),
                None,
            );

            client_tx.send(Ok("[1, 2]".to_string())).unwrap();
            let state = connection.run(&mut source, &mut sink).await;

            assert_eq!(state, ConnectionState::Failed);
            assert_eq!(connection.state(), ConnectionState::Failed);
            assert!(connection.last_error().unwrap().starts_with("Invalid message"));
            assert!(registry.get(connection.id()).is_none());

            // Running again is a no-op
            assert_eq!(
                connection.run(&mut source, &mut sink).await,
                ConnectionState::Failed
            );
        }

        #[tokio::test]
        async fn test_closure_before_connect_is_silent() {
            let session = FakeSession::new(FakeChannel::new());
            let harness = Harness::start(config(), session.clone());

            let (state, messages) = {
                let Harness {
                    client_tx,
                    mut client_rx,
                    task,
                    ..
                } = harness;
                drop(client_tx);
                let state = task.await.unwrap();
                let mut messages = Vec::new();
                while let Some(msg) = client_rx.recv().await {
                    messages.push(msg);
                }
                (state, messages)
            };

            assert_eq!(state, ConnectionState::Closed);
            assert!(messages.is_empty());
            assert_eq!(session.calls(), vec!["close"]);
        }

        #[tokio::test]
        async fn test_non_connect_messages_ignored_before_connect() {
            let channel = FakeChannel::new();
            channel.finish();
            let session = FakeSession::new(channel.clone());
            let harness = Harness::start(config(), session);

            harness.send(r#"{"type":"input","data":"early"}"#);
            harness.send(r#"{"type":"resize","cols":80}"#);
            harness.send(CONNECT);

            let (state, messages) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert_eq!(messages, vec![ServerMessage::success()]);
            assert!(channel.written().is_empty());
        }
    }

    mod setup {
        use super::*;

        const FOREVER: Duration = Duration::from_secs(3600);

        #[tokio::test]
        async fn test_client_leaving_while_authenticating_is_closure() {
            let session =
                FakeSession::pausing_at(FakeChannel::new(), Stage::Authenticate, FOREVER);
            let harness = Harness::start(config(), session.clone());

            harness.send(CONNECT);
            wait_until(|| session.calls().len() == 2).await;
            assert_eq!(
                harness.registry.get(&harness.connection_id).unwrap().state,
                ConnectionState::Authenticating
            );

            let Harness {
                client_tx,
                mut client_rx,
                registry,
                task,
                ..
            } = harness;
            drop(client_tx);
            let state = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("connection ends without waiting for the step")
                .unwrap();

            assert_eq!(state, ConnectionState::Closed);
            assert!(client_rx.recv().await.is_none());
            assert_eq!(
                session.calls(),
                vec!["connect h:22", "authenticate u", "close"]
            );
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn test_client_leaving_while_connecting_leaves_no_error() {
            let registry = Arc::new(ConnectionRegistry::new());
            let (mut source, client_tx, mut sink, client_rx) = message_pair();
            let session = FakeSession::pausing_at(FakeChannel::new(), Stage::Connect, FOREVER);
            let mut connection = Connection::new(
                config(),
                Box::new(session.clone()),
                Arc::clone(&registry),
                None,
            );

            client_tx.send(Ok(CONNECT.to_string())).unwrap();
            client_tx
                .send(Ok(r#"{"type":"input","data":"typed early"}"#.to_string()))
                .unwrap();
            drop(client_tx);
            drop(client_rx);

            let state = tokio::time::timeout(
                Duration::from_secs(2),
                connection.run(&mut source, &mut sink),
            )
            .await
            .expect("connection ends without waiting for the step");

            assert_eq!(state, ConnectionState::Closed);
            assert!(connection.last_error().is_none());
            assert_eq!(session.calls(), vec!["connect h:22", "close"]);
        }

        #[tokio::test]
        async fn test_input_sent_during_setup_forwarded_in_order() {
            let channel = FakeChannel::new();
            let session = FakeSession::pausing_at(
                channel.clone(),
                Stage::OpenChannel,
                Duration::from_millis(100),
            );
            let mut harness = Harness::start(config(), session);

            harness.send(CONNECT);
            for data in ["a", "b", "c"] {
                harness.send(&serde_json::json!({"type": "input", "data": data}).to_string());
            }

            assert_eq!(harness.recv().await, Some(ServerMessage::success()));
            wait_until(|| channel.written().len() == 3).await;
            assert_eq!(
                channel.written(),
                vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
            );

            channel.finish();
            let (state, rest) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert!(rest.is_empty());
        }

        #[tokio::test]
        async fn test_server_role_ignores_connect_fields() {
            let channel = FakeChannel::new();
            channel.finish();
            let session = FakeSession::new(channel);
            let config = Arc::new(BridgeConfig {
                shell_role: ShellRole::Server,
                ..BridgeConfig::default()
            });
            assert!(config.use_client_credentials);
            let harness = Harness::start(config, session.clone());

            harness.send(
                r#"{"type":"connect","host":"0.0.0.0","port":1,"username":"alice","password":"pw"}"#,
            );
            let (state, messages) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert_eq!(messages, vec![ServerMessage::success()]);
            assert_eq!(session.calls()[0], "connect localhost:2222");
            assert_eq!(session.calls()[1], "authenticate testuser");
        }

        #[cfg(debug_assertions)]
        #[test]
        #[should_panic(expected = "invalid transition")]
        fn test_backward_transition_is_caught() {
            let mut connection = Connection::new(
                config(),
                Box::new(FakeSession::new(FakeChannel::new())),
                Arc::new(ConnectionRegistry::new()),
                None,
            );
            connection.transition(ConnectionState::Streaming);
            connection.transition(ConnectionState::Connecting);
        }
    }

    mod streaming {
        use super::*;

        #[tokio::test]
        async fn test_unknown_type_does_not_terminate() {
            let channel = FakeChannel::new();
            let session = FakeSession::new(channel.clone());
            let mut harness = Harness::start(config(), session);

            harness.send(CONNECT);
            assert_eq!(harness.recv().await, Some(ServerMessage::success()));

            harness.send(r#"{"type":"resize","cols":120,"rows":40}"#);
            harness.send(r#"{"type":"input","data":"x"}"#);
            wait_until(|| channel.written() == vec![b"x".to_vec()]).await;
            assert!(!harness.task.is_finished());

            channel.finish();
            let (state, rest) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert!(rest.is_empty());
        }

        #[tokio::test]
        async fn test_malformed_message_closes_without_notification() {
            let channel = FakeChannel::new();
            let session = FakeSession::new(channel.clone());
            let mut harness = Harness::start(config(), session);

            harness.send(CONNECT);
            assert_eq!(harness.recv().await, Some(ServerMessage::success()));
            harness.send("{broken");

            let (state, rest) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert!(rest.is_empty());
            assert_eq!(channel.close_calls(), 1);
        }

        #[tokio::test]
        async fn test_input_fidelity() {
            let channel = FakeChannel::new();
            let session = FakeSession::new(channel.clone());
            let mut harness = Harness::start(config(), session);

            harness.send(CONNECT);
            assert_eq!(harness.recv().await, Some(ServerMessage::success()));

            let payloads: Vec<String> = (0..50).map(|i| format!("cmd {}\r", i)).collect();
            for payload in &payloads {
                harness.send(&serde_json::json!({"type": "input", "data": payload}).to_string());
            }
            wait_until(|| channel.written().len() == payloads.len()).await;

            let expected: Vec<Vec<u8>> = payloads.iter().map(|p| p.as_bytes().to_vec()).collect();
            assert_eq!(channel.written(), expected);

            channel.finish();
            let (state, _) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
        }

        #[tokio::test]
        async fn test_cancellation_closes_connection() {
            let channel = FakeChannel::new();
            let session = FakeSession::new(channel.clone());
            let mut harness = Harness::start(config(), session.clone());

            harness.send(CONNECT);
            assert_eq!(harness.recv().await, Some(ServerMessage::success()));
            harness.registry.cancel_all();

            let (state, rest) = harness.finish().await;
            assert_eq!(state, ConnectionState::Closed);
            assert!(rest.is_empty());
            assert_eq!(channel.close_calls(), 1);
            assert_eq!(session.calls().last().map(String::as_str), Some("close"));
        }
    }
}
