//! Authentication policy trait definition.

use russh::{MethodKind, MethodSet};

/// Result of evaluating one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted,
    Rejected,
}

impl AuthDecision {
    pub fn is_accepted(self) -> bool {
        self == AuthDecision::Accepted
    }
}

/// Trait for credential policies.
///
/// Policies are process-wide read-only configuration shared by every inbound
/// connection, so implementations must be `Send + Sync` and must not mutate
/// state on evaluation. Each attempt is judged on its own: there is no
/// attempt counting or lockout.
pub trait AuthPolicy: Send + Sync {
    /// Evaluate a password authentication attempt.
    fn evaluate(&self, username: &str, password: &str) -> AuthDecision;

    /// Authentication methods offered to the client.
    fn allowed_methods(&self) -> MethodSet {
        MethodSet::from(&[MethodKind::Password][..])
    }

    /// Get the name of this policy, used for logging.
    fn name(&self) -> &'static str;
}
