//! Bidirectional pump between a shell channel and the message channel.
//!
//! Two workers run while a connection is streaming:
//!
//! - **output**: reads bounded chunks from the shell channel and forwards each
//!   read as one `output` message. Between reads it suspends on the channel's
//!   readiness (bounded by the poll interval) instead of spinning.
//! - **input**: forwards the payload of every `input` message to the shell in
//!   receipt order. Other well-formed messages are ignored; an unparseable
//!   message stops the pump.
//!
//! [`run_pumps`] polls both from a single task. Whichever stops first drops
//! the other, so neither touches the channel once `run_pumps` returns.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{BridgeError, ChannelError, MessageError};
use super::shell::ShellChannel;
use super::transport::{MessageSink, MessageSource};
use super::types::{ClientMessage, ServerMessage};

/// Tunables of the output pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    /// Maximum bytes taken from the channel per read
    pub read_chunk: usize,
    /// Upper bound on one idle wait for output
    pub poll_interval: Duration,
}

/// Why streaming stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The shell closed its channel and all output was forwarded
    ShellClosed,
    /// The client closed the message channel
    ClientClosed,
    /// Process shutdown
    Cancelled,
    /// Either side failed; never reported to the client once streaming
    Failed(BridgeError),
}

/// Incremental UTF-8 decoder for shell output.
///
/// A multi-byte sequence split across two reads is carried over to the next
/// call. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        text
    }

    /// Flush whatever is still buffered, replacing it if incomplete.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn sink_exit(error: MessageError) -> PumpExit {
    match error {
        MessageError::Closed => PumpExit::ClientClosed,
        other => PumpExit::Failed(other.into()),
    }
}

/// Forward shell output until the channel closes or the client goes away.
pub async fn output_pump(
    channel: &dyn ShellChannel,
    sink: &mut dyn MessageSink,
    settings: PumpSettings,
) -> PumpExit {
    let mut decoder = Utf8Decoder::default();

    loop {
        let chunk = channel.read_available(settings.read_chunk).await;

        if chunk.is_empty() {
            if channel.is_closed() {
                if decoder.has_pending() {
                    let tail = decoder.finish();
                    if let Err(e) = sink.send(&ServerMessage::output(tail)).await {
                        return sink_exit(e);
                    }
                }
                debug!("Shell channel closed");
                return PumpExit::ShellClosed;
            }
            channel.wait_readable(settings.poll_interval).await;
            continue;
        }

        let text = decoder.decode(&chunk);
        if text.is_empty() {
            continue;
        }

        if let Err(e) = sink.send(&ServerMessage::output(text)).await {
            return sink_exit(e);
        }
    }
}

/// Forward `input` messages to the shell until the client stops sending.
pub async fn input_pump(channel: &dyn ShellChannel, source: &mut dyn MessageSource) -> PumpExit {
    loop {
        let raw = match source.next_message().await {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(MessageError::Closed) => return PumpExit::ClientClosed,
            Err(e) => return PumpExit::Failed(e.into()),
        };

        match ClientMessage::parse(&raw) {
            Ok(ClientMessage::Input { data }) => {
                if let Err(e) = channel.write(data.as_bytes()).await {
                    return match e {
                        ChannelError::Closed => PumpExit::ShellClosed,
                        other => PumpExit::Failed(other.into()),
                    };
                }
            }
            Ok(ClientMessage::Connect(_)) => {
                debug!("Ignoring connect message while streaming");
            }
            Ok(ClientMessage::Unknown) => {
                debug!("Ignoring message of unknown type");
            }
            Err(e) => {
                warn!("Dropping connection on malformed message: {}", e);
                return PumpExit::Failed(e.into());
            }
        }
    }
}

/// Run both pumps until one stops or `cancel` fires.
pub async fn run_pumps(
    channel: &dyn ShellChannel,
    source: &mut dyn MessageSource,
    sink: &mut dyn MessageSink,
    settings: PumpSettings,
    cancel: &CancellationToken,
) -> PumpExit {
    tokio::select! {
        exit = output_pump(channel, sink, settings) => exit,
        exit = input_pump(channel, source) => exit,
        _ = cancel.cancelled() => PumpExit::Cancelled,
    }
}
