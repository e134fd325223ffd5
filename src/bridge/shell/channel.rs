//! Facade channel over a russh session channel.
//!
//! The russh channel is split so that the input pump can write without
//! waiting on the read side:
//!
//! - Reads go through `ChannelReadHalf::wait()` under a mutex and land in a
//!   pending buffer that `read_available` drains in bounded chunks.
//! - Writes go straight to the `ChannelWriteHalf`.
//!
//! Works for both client-side (`client::Msg`) and server-side
//! (`server::Msg`) channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use russh::{Channel, ChannelId, ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bridge::error::ChannelError;

use super::ShellChannel;

/// Read side state: the russh reader plus output not yet handed out.
struct Inbound {
    reader: ChannelReadHalf,
    pending: Vec<u8>,
    eof: bool,
}

impl Inbound {
    fn absorb(&mut self, msg: Option<ChannelMsg>) {
        match msg {
            Some(ChannelMsg::Data { data }) => {
                self.pending.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                // stderr goes to the same terminal
                self.pending.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                debug!("Shell exited with status {}", exit_status);
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                self.eof = true;
            }
            Some(_) => {
                // Ignore other message types
            }
        }
    }

    fn drained(&self) -> bool {
        self.eof && self.pending.is_empty()
    }
}

/// [`ShellChannel`] backed by a russh channel.
pub struct RusshChannel<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    id: ChannelId,
    inbound: Mutex<Inbound>,
    writer: ChannelWriteHalf<S>,
    /// Set once the peer closed and all buffered output was read, or on local close
    closed: AtomicBool,
    /// Guards the close message so it is sent at most once
    released: AtomicBool,
}

impl<S> RusshChannel<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    pub fn new(channel: Channel<S>) -> Self {
        let id = channel.id();
        let (reader, writer) = channel.split();
        Self {
            id,
            inbound: Mutex::new(Inbound {
                reader,
                pending: Vec::with_capacity(4096),
                eof: false,
            }),
            writer,
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> ShellChannel for RusshChannel<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    async fn read_available(&self, max_bytes: usize) -> Vec<u8> {
        let mut guard = self.inbound.lock().await;
        let inbound = &mut *guard;

        // Pull whatever russh already queued, never waiting for more
        while inbound.pending.len() < max_bytes && !inbound.eof {
            let next = inbound.reader.wait().now_or_never();
            match next {
                Some(msg) => inbound.absorb(msg),
                None => break,
            }
        }

        let take = inbound.pending.len().min(max_bytes);
        let chunk: Vec<u8> = inbound.pending.drain(..take).collect();

        if inbound.drained() {
            self.closed.store(true, Ordering::SeqCst);
        }

        chunk
    }

    async fn wait_readable(&self, interval: Duration) {
        let mut guard = self.inbound.lock().await;
        let inbound = &mut *guard;

        if !inbound.pending.is_empty() || inbound.eof {
            if inbound.drained() {
                self.closed.store(true, Ordering::SeqCst);
            }
            return;
        }

        if let Ok(msg) = tokio::time::timeout(interval, inbound.reader.wait()).await {
            inbound.absorb(msg);
            if inbound.drained() {
                self.closed.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.released.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        self.writer
            .data(data)
            .await
            .map_err(|e| ChannelError::Write(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);

        // The peer may already be gone; closing is best-effort
        if let Err(e) = self.writer.close().await {
            warn!("Failed to close shell channel {:?}: {}", self.id, e);
        }
    }
}
