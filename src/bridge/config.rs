//! Configuration resolution for the bridge.
//!
//! Every setting is resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable (`.env` is honoured)
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BRIDGE_LISTEN_ADDR` | 127.0.0.1:8080 | WebSocket listener address |
//! | `BRIDGE_SHELL_ROLE` | client | `client` (outbound SSH) or `server` (accept inbound SSH) |
//! | `BRIDGE_USE_CLIENT_CREDENTIALS` | true | Use credentials from the `connect` message (client role only) |
//! | `BRIDGE_SSH_HOST` | localhost | Fixed SSH target host, or listener host in server role |
//! | `BRIDGE_SSH_PORT` | 2222 | Fixed SSH target port, or listener port in server role |
//! | `BRIDGE_SSH_USERNAME` | testuser | Fixed SSH username |
//! | `BRIDGE_SSH_PASSWORD` | testpass | Fixed SSH password |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connect and authenticate timeout in seconds |
//! | `SSH_CHANNEL_TIMEOUT` | 20s | Channel negotiation timeout in seconds |
//! | `BRIDGE_POLL_INTERVAL_MS` | 100ms | Output pump idle interval |
//! | `BRIDGE_READ_CHUNK` | 1024 | Maximum bytes per output read |
//! | `SSH_SERVER_ENABLED` | false | Start the standalone demo SSH server |
//! | `SSH_SERVER_ADDR` | 0.0.0.0:2222 | Demo SSH server listener address |
//! | `SSH_HOST_KEY_PATH` | ssh_host_ed25519_key | Host key used by the server roles |
//!
//! The resolved [`BridgeConfig`] is built once at startup and shared read-only.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::pump::PumpSettings;
use super::types::{ConnectRequest, Credentials};

/// Default WebSocket listener address
pub(crate) const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default fixed SSH target host
pub(crate) const DEFAULT_SSH_HOST: &str = "localhost";

/// Default fixed SSH target port
pub(crate) const DEFAULT_SSH_PORT: u16 = 2222;

/// Default fixed SSH username
pub(crate) const DEFAULT_SSH_USERNAME: &str = "testuser";

/// Default fixed SSH password
pub(crate) const DEFAULT_SSH_PASSWORD: &str = "testpass";

/// Default connect/authenticate timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default channel negotiation timeout in seconds
pub(crate) const DEFAULT_CHANNEL_TIMEOUT_SECS: u64 = 20;

/// Default output pump idle interval in milliseconds
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default maximum bytes per output read
pub(crate) const DEFAULT_READ_CHUNK: usize = 1024;

/// Default demo SSH server listener address
pub(crate) const DEFAULT_SSH_SERVER_ADDR: &str = "0.0.0.0:2222";

/// Default host key path for the server roles
pub(crate) const DEFAULT_HOST_KEY_PATH: &str = "ssh_host_ed25519_key";

pub(crate) const LISTEN_ADDR_ENV_VAR: &str = "BRIDGE_LISTEN_ADDR";
pub(crate) const SHELL_ROLE_ENV_VAR: &str = "BRIDGE_SHELL_ROLE";
pub(crate) const USE_CLIENT_CREDENTIALS_ENV_VAR: &str = "BRIDGE_USE_CLIENT_CREDENTIALS";
pub(crate) const SSH_HOST_ENV_VAR: &str = "BRIDGE_SSH_HOST";
pub(crate) const SSH_PORT_ENV_VAR: &str = "BRIDGE_SSH_PORT";
pub(crate) const SSH_USERNAME_ENV_VAR: &str = "BRIDGE_SSH_USERNAME";
pub(crate) const SSH_PASSWORD_ENV_VAR: &str = "BRIDGE_SSH_PASSWORD";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const CHANNEL_TIMEOUT_ENV_VAR: &str = "SSH_CHANNEL_TIMEOUT";
pub(crate) const POLL_INTERVAL_MS_ENV_VAR: &str = "BRIDGE_POLL_INTERVAL_MS";
pub(crate) const READ_CHUNK_ENV_VAR: &str = "BRIDGE_READ_CHUNK";
pub(crate) const SSH_SERVER_ENABLED_ENV_VAR: &str = "SSH_SERVER_ENABLED";
pub(crate) const SSH_SERVER_ADDR_ENV_VAR: &str = "SSH_SERVER_ADDR";
pub(crate) const HOST_KEY_PATH_ENV_VAR: &str = "SSH_HOST_KEY_PATH";

/// Which side of the SSH protocol the bridge plays for each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellRole {
    /// Connect out to an SSH server and drive its shell
    Client,
    /// Listen for one inbound SSH client per connection and bridge its channel
    Server,
}

impl FromStr for ShellRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(ShellRole::Client),
            "server" => Ok(ShellRole::Server),
            other => Err(format!("Unknown shell role: {}", other)),
        }
    }
}

/// Resolve a parsed value with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall back to the default.
pub(crate) fn resolve_parsed<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

/// Resolve a string with priority: parameter -> env var -> default.
pub(crate) fn resolve_string(param: Option<String>, env_var: &str, default: &str) -> String {
    if let Some(value) = param {
        return value;
    }

    match env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

/// Resolve a flag with priority: parameter -> env var -> default.
///
/// The environment value is true only for `true` (any case) or `1`.
pub(crate) fn resolve_flag(param: Option<bool>, env_var: &str, default: bool) -> bool {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var) {
        return raw.trim().eq_ignore_ascii_case("true") || raw.trim() == "1";
    }

    default
}

/// Process-wide bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_addr: String,
    pub shell_role: ShellRole,
    /// When false, `connect` fields are ignored in favour of `fixed_credentials`.
    /// Has no effect in server role.
    pub use_client_credentials: bool,
    pub fixed_credentials: Credentials,
    pub connect_timeout: Duration,
    pub channel_timeout: Duration,
    pub poll_interval: Duration,
    pub read_chunk: usize,
    pub demo_server_enabled: bool,
    pub demo_server_addr: String,
    pub host_key_path: PathBuf,
}

impl BridgeConfig {
    /// Build the configuration from environment variables and defaults.
    pub fn from_env() -> Self {
        Self {
            listen_addr: resolve_string(None, LISTEN_ADDR_ENV_VAR, DEFAULT_LISTEN_ADDR),
            shell_role: resolve_parsed(None, SHELL_ROLE_ENV_VAR, ShellRole::Client),
            use_client_credentials: resolve_flag(None, USE_CLIENT_CREDENTIALS_ENV_VAR, true),
            fixed_credentials: Credentials {
                host: resolve_string(None, SSH_HOST_ENV_VAR, DEFAULT_SSH_HOST),
                port: resolve_parsed(None, SSH_PORT_ENV_VAR, DEFAULT_SSH_PORT),
                username: resolve_string(None, SSH_USERNAME_ENV_VAR, DEFAULT_SSH_USERNAME),
                password: resolve_string(None, SSH_PASSWORD_ENV_VAR, DEFAULT_SSH_PASSWORD),
            },
            connect_timeout: Duration::from_secs(resolve_parsed(
                None,
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            channel_timeout: Duration::from_secs(resolve_parsed(
                None,
                CHANNEL_TIMEOUT_ENV_VAR,
                DEFAULT_CHANNEL_TIMEOUT_SECS,
            )),
            poll_interval: Duration::from_millis(resolve_parsed(
                None,
                POLL_INTERVAL_MS_ENV_VAR,
                DEFAULT_POLL_INTERVAL_MS,
            )),
            read_chunk: resolve_parsed(None, READ_CHUNK_ENV_VAR, DEFAULT_READ_CHUNK).max(1),
            demo_server_enabled: resolve_flag(None, SSH_SERVER_ENABLED_ENV_VAR, false),
            demo_server_addr: resolve_string(None, SSH_SERVER_ADDR_ENV_VAR, DEFAULT_SSH_SERVER_ADDR),
            host_key_path: PathBuf::from(resolve_string(
                None,
                HOST_KEY_PATH_ENV_VAR,
                DEFAULT_HOST_KEY_PATH,
            )),
        }
    }

    /// Pick the credentials for a `connect` request.
    ///
    /// The request is ignored entirely in favour of the fixed credentials when
    /// `use_client_credentials` is disabled, and always in server role, where
    /// they name the listener address and the only accepted login.
    pub fn resolve_credentials(&self, request: ConnectRequest) -> Credentials {
        if self.use_client_credentials && self.shell_role == ShellRole::Client {
            Credentials::from(request)
        } else {
            self.fixed_credentials.clone()
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            read_chunk: self.read_chunk,
            poll_interval: self.poll_interval,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            shell_role: ShellRole::Client,
            use_client_credentials: true,
            fixed_credentials: Credentials {
                host: DEFAULT_SSH_HOST.to_string(),
                port: DEFAULT_SSH_PORT,
                username: DEFAULT_SSH_USERNAME.to_string(),
                password: DEFAULT_SSH_PASSWORD.to_string(),
            },
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            channel_timeout: Duration::from_secs(DEFAULT_CHANNEL_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            read_chunk: DEFAULT_READ_CHUNK,
            demo_server_enabled: false,
            demo_server_addr: DEFAULT_SSH_SERVER_ADDR.to_string(),
            host_key_path: PathBuf::from(DEFAULT_HOST_KEY_PATH),
        }
    }
}
