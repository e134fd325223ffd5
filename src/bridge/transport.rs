//! Message channel over WebSocket.
//!
//! The bridge only needs two capabilities from its client transport, modelled
//! as [`MessageSource`] and [`MessageSink`]. The poem WebSocket stream is split
//! into both halves so the input pump can wait for the next frame while the
//! output pump keeps sending.
//!
//! Frame handling:
//!
//! - Text frames carry one JSON message each
//! - Binary frames are decoded as UTF-8 text
//! - Ping and pong frames are skipped
//! - A close frame or the end of the stream is a normal closure

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use poem::web::websocket::{Message, WebSocket};
use poem::web::{Data, RemoteAddr};
use poem::middleware::Tracing;
use poem::{Endpoint, EndpointExt, IntoResponse, Route, get, handler};
use tracing::{debug, info, warn};

use super::config::BridgeConfig;
use super::error::MessageError;
use super::lifecycle::Connection;
use super::registry::ConnectionRegistry;
use super::shell::{RoleSessionFactory, SessionFactory};
use super::types::ServerMessage;

/// Inbound half of the message channel.
#[async_trait]
pub trait MessageSource: Send {
    /// Next raw text message, or `Ok(None)` once the client closed.
    async fn next_message(&mut self) -> Result<Option<String>, MessageError>;
}

/// Outbound half of the message channel.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), MessageError>;

    /// Close the outbound half. Idempotent.
    async fn close(&mut self);
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

fn transport_error(error: io::Error) -> MessageError {
    if is_disconnect(&error) {
        MessageError::Closed
    } else {
        MessageError::Transport(error.to_string())
    }
}

/// Receiving half of a WebSocket.
pub struct WsSource<S> {
    stream: S,
    closed: bool,
}

impl<S> WsSource<S>
where
    S: Stream<Item = Result<Message, io::Error>> + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> MessageSource for WsSource<S>
where
    S: Stream<Item = Result<Message, io::Error>> + Unpin + Send,
{
    async fn next_message(&mut self) -> Result<Option<String>, MessageError> {
        if self.closed {
            return Ok(None);
        }

        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    self.closed = true;
                    return match transport_error(e) {
                        MessageError::Closed => Ok(None),
                        other => Err(other),
                    };
                }
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            };

            match frame {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(bytes) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .map_err(|e| MessageError::Malformed(e.to_string()));
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => {
                    debug!("WebSocket close frame received");
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// Sending half of a WebSocket.
pub struct WsSink<S> {
    sink: S,
    closed: bool,
}

impl<S> WsSink<S>
where
    S: Sink<Message, Error = io::Error> + Unpin + Send,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: Sink<Message, Error = io::Error> + Unpin + Send,
{
    async fn send(&mut self, message: &ServerMessage) -> Result<(), MessageError> {
        if self.closed {
            return Err(MessageError::Closed);
        }

        let json = serde_json::to_string(message)
            .map_err(|e| MessageError::Transport(format!("Failed to encode message: {}", e)))?;
        self.sink.send(Message::Text(json)).await.map_err(|e| {
            self.closed = true;
            transport_error(e)
        })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Source that reads ahead while the connection is still being set up.
///
/// Messages read ahead are handed out again, in order, before anything new
/// from the wrapped source.
pub struct BufferedSource<'a> {
    inner: &'a mut dyn MessageSource,
    buffered: VecDeque<String>,
}

impl<'a> BufferedSource<'a> {
    pub fn new(inner: &'a mut dyn MessageSource) -> Self {
        Self {
            inner,
            buffered: VecDeque::new(),
        }
    }

    /// Buffer incoming messages until the client goes away.
    ///
    /// Only completes on closure or a transport failure, so it is meant to be
    /// raced against the step in progress. Dropping it loses nothing.
    pub async fn until_closed(&mut self) -> MessageError {
        loop {
            match self.inner.next_message().await {
                Ok(Some(raw)) => self.buffered.push_back(raw),
                Ok(None) => return MessageError::Closed,
                Err(e) => return e,
            }
        }
    }
}

#[async_trait]
impl MessageSource for BufferedSource<'_> {
    async fn next_message(&mut self) -> Result<Option<String>, MessageError> {
        match self.buffered.pop_front() {
            Some(raw) => Ok(Some(raw)),
            None => self.inner.next_message().await,
        }
    }
}

/// Shared state of the WebSocket endpoint.
pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub factory: Arc<dyn SessionFactory>,
    pub registry: Arc<ConnectionRegistry>,
}

impl BridgeState {
    /// State whose shell sessions follow the configured role.
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        let factory = Arc::new(RoleSessionFactory::new(Arc::clone(&config)));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: Arc<BridgeConfig>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            config,
            factory,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }
}

/// Upgrade to a WebSocket and bridge it to a fresh shell session.
#[handler]
fn bridge_socket(
    ws: WebSocket,
    remote_addr: &RemoteAddr,
    Data(state): Data<&Arc<BridgeState>>,
) -> impl IntoResponse {
    let state = Arc::clone(state);
    let peer = remote_addr.to_string();

    ws.on_upgrade(move |socket| async move {
        info!("WebSocket client connected from {}", peer);
        let (sink, stream) = socket.split();
        let mut source = WsSource::new(stream);
        let mut sink = WsSink::new(sink);

        let mut connection = Connection::new(
            Arc::clone(&state.config),
            state.factory.create(),
            Arc::clone(&state.registry),
            Some(peer),
        );
        connection.run(&mut source, &mut sink).await;

        match connection.last_error() {
            Some(reason) => warn!(
                connection_id = %connection.id(),
                "Session ended in {}: {}", connection.state(), reason
            ),
            None => info!(
                connection_id = %connection.id(),
                "Session ended in {}", connection.state()
            ),
        }
    })
}

/// Build the HTTP application serving the bridge at `/`.
pub fn build_app(state: Arc<BridgeState>) -> impl Endpoint {
    Route::new()
        .at("/", get(bridge_socket))
        .data(state)
        .with(Tracing)
}
