//! Authentication policy for inbound SSH clients.
//!
//! Used only when the bridge acts as an SSH server. A policy decides whether
//! presented credentials are accepted and reports which authentication
//! methods the server offers.
//!
//! # Available Policies
//!
//! - [`FixedCredentials`]: a single accepted username/password pair
//!
//! # Example
//!
//! ```ignore
//! use webssh_bridge::bridge::auth::{AuthPolicy, FixedCredentials};
//!
//! let policy = FixedCredentials::new("testuser", "testpass");
//! assert!(policy.evaluate("testuser", "testpass").is_accepted());
//! ```

mod password;
mod traits;

pub use password::FixedCredentials;
pub use traits::{AuthDecision, AuthPolicy};
