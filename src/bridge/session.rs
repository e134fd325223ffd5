//! russh client handler for outbound shell sessions.
//!
//! `BridgeClientHandler` accepts all server host keys (similar to
//! `StrictHostKeyChecking=no` in OpenSSH). In production environments, this
//! should be extended to verify against known_hosts.

use russh::{client, keys};
use tracing::debug;

/// Client handler for russh that accepts all host keys.
pub struct BridgeClientHandler {
    target: String,
}

impl BridgeClientHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl client::Handler for BridgeClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all host keys (similar to StrictHostKeyChecking=no)
        debug!(
            "Accepting host key {} for {}",
            server_public_key.algorithm().as_str(),
            self.target
        );
        Ok(true)
    }
}
