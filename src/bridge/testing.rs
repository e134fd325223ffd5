//! Test support: in-memory fakes of the shell facade and the message
//! channel, plus helpers for real SSH sessions over loopback.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key::LineEnding;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::demo::DemoServer;
use super::error::{AuthError, ChannelError, ConnectError, MessageError};
use super::pump::PumpSettings;
use super::shell::{SessionFactory, ShellChannel, ShellSession};
use super::transport::{MessageSink, MessageSource};
use super::types::{Credentials, ServerMessage};

#[derive(Default)]
struct FakeChannelInner {
    output: StdMutex<VecDeque<u8>>,
    written: StdMutex<Vec<Vec<u8>>>,
    eof: AtomicBool,
    close_calls: AtomicUsize,
}

/// Shell channel whose output is pushed by the test.
#[derive(Clone, Default)]
pub struct FakeChannel {
    inner: Arc<FakeChannelInner>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_output(&self, bytes: &[u8]) {
        self.inner
            .output
            .lock()
            .unwrap()
            .extend(bytes.iter().copied());
    }

    /// Shell side closes once the queued output is read.
    pub fn finish(&self) {
        self.inner.eof.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.written.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    fn released(&self) -> bool {
        self.close_calls() > 0
    }
}

#[async_trait]
impl ShellChannel for FakeChannel {
    async fn read_available(&self, max_bytes: usize) -> Vec<u8> {
        let mut output = self.inner.output.lock().unwrap();
        let take = output.len().min(max_bytes);
        output.drain(..take).collect()
    }

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.released() || self.inner.eof.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.inner.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.released()
            || (self.inner.eof.load(Ordering::SeqCst)
                && self.inner.output.lock().unwrap().is_empty())
    }

    async fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Setup step of a [`FakeSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Authenticate,
    OpenChannel,
}

/// Shell session that records calls and fails or pauses at a chosen stage.
#[derive(Clone)]
pub struct FakeSession {
    channel: FakeChannel,
    fail_at: Option<Stage>,
    pause_at: Option<(Stage, Duration)>,
    calls: Arc<StdMutex<Vec<String>>>,
}

impl FakeSession {
    pub fn new(channel: FakeChannel) -> Self {
        Self {
            channel,
            fail_at: None,
            pause_at: None,
            calls: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn failing_at(channel: FakeChannel, stage: Stage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::new(channel)
        }
    }

    /// Session whose `stage` takes `pause` before succeeding.
    pub fn pausing_at(channel: FakeChannel, stage: Stage, pause: Duration) -> Self {
        Self {
            pause_at: Some((stage, pause)),
            ..Self::new(channel)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn step(&self, stage: Stage) -> bool {
        if let Some((paused, pause)) = self.pause_at
            && paused == stage
        {
            tokio::time::sleep(pause).await;
        }
        self.fail_at == Some(stage)
    }
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.record(format!("connect {}:{}", host, port));
        if self.step(Stage::Connect).await {
            return Err(ConnectError::Transport {
                address: format!("{}:{}", host, port),
                reason: "Connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), AuthError> {
        self.record(format!("authenticate {}", credentials.username));
        if self.step(Stage::Authenticate).await {
            return Err(AuthError::Rejected(credentials.username.clone()));
        }
        Ok(())
    }

    async fn open_interactive_channel(&mut self) -> Result<Box<dyn ShellChannel>, ChannelError> {
        self.record("open_channel".to_string());
        if self.step(Stage::OpenChannel).await {
            return Err(ChannelError::Rejected(
                "administratively prohibited".to_string(),
            ));
        }
        Ok(Box::new(self.channel.clone()))
    }

    async fn close(&mut self) {
        self.record("close".to_string());
    }
}

/// Factory handing out clones of one [`FakeSession`].
pub struct FakeFactory {
    session: FakeSession,
}

impl FakeFactory {
    pub fn succeeding() -> Self {
        Self {
            session: FakeSession::new(FakeChannel::new()),
        }
    }
}

impl SessionFactory for FakeFactory {
    fn create(&self) -> Box<dyn ShellSession> {
        Box::new(self.session.clone())
    }
}

/// Inbound message channel fed by the test.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<String, MessageError>>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<String>, MessageError> {
        match self.rx.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Outbound message channel observed by the test.
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<ServerMessage>>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), MessageError> {
        let tx = self.tx.as_ref().ok_or(MessageError::Closed)?;
        tx.send(message.clone()).map_err(|_| MessageError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

/// Message channel pair: (bridge source, client sender, bridge sink, client receiver).
pub fn message_pair() -> (
    ChannelSource,
    mpsc::UnboundedSender<Result<String, MessageError>>,
    ChannelSink,
    mpsc::UnboundedReceiver<ServerMessage>,
) {
    let (client_tx, source_rx) = mpsc::unbounded_channel();
    let (sink_tx, client_rx) = mpsc::unbounded_channel();
    (
        ChannelSource { rx: source_rx },
        client_tx,
        ChannelSink { tx: Some(sink_tx) },
        client_rx,
    )
}

pub fn test_credentials(port: u16) -> Credentials {
    Credentials {
        host: "127.0.0.1".to_string(),
        port,
        username: "testuser".to_string(),
        password: "testpass".to_string(),
    }
}

pub fn fast_pump_settings() -> PumpSettings {
    PumpSettings {
        read_chunk: 1024,
        poll_interval: Duration::from_millis(5),
    }
}

pub fn random_host_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// Write a fresh host key to a unique file under the temp directory.
pub fn host_key_file() -> PathBuf {
    let path = std::env::temp_dir().join(format!("webssh-bridge-key-{}", uuid::Uuid::new_v4()));
    random_host_key()
        .write_openssh_file(&path, LineEnding::LF)
        .unwrap();
    path
}

/// Loopback port that was free a moment ago.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Demo SSH server on a loopback port, accepting `testuser`/`testpass`.
pub async fn spawn_demo_server() -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = DemoServer::new(
        format!("127.0.0.1:{}", port),
        random_host_key(),
        &test_credentials(port),
        fast_pump_settings(),
    );
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, cancel.clone()));
    (port, cancel)
}

/// Read from a shell channel until the collected output contains `needle`.
pub async fn read_until(channel: &dyn ShellChannel, needle: &str) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected.contains(needle) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no {:?} in {:?}",
            needle,
            collected
        );
        let chunk = channel.read_available(1024).await;
        if chunk.is_empty() {
            assert!(!channel.is_closed(), "closed before {:?}: {:?}", needle, collected);
            channel.wait_readable(Duration::from_millis(20)).await;
        } else {
            collected.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
    collected
}

/// Drain a shell channel until it reports closed.
pub async fn read_to_close(channel: &dyn ShellChannel) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let chunk = channel.read_available(1024).await;
        if !chunk.is_empty() {
            collected.push_str(&String::from_utf8_lossy(&chunk));
            continue;
        }
        if channel.is_closed() {
            return collected;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel still open after {:?}",
            collected
        );
        channel.wait_readable(Duration::from_millis(20)).await;
    }
}
