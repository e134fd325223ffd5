//! Fixed username/password policy.

use crate::bridge::types::Credentials;

use super::traits::{AuthDecision, AuthPolicy};

/// Accepts exactly one username/password pair.
pub struct FixedCredentials {
    username: String,
    password: String,
}

impl FixedCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl From<&Credentials> for FixedCredentials {
    fn from(credentials: &Credentials) -> Self {
        Self::new(credentials.username.clone(), credentials.password.clone())
    }
}

/// Compare without returning early on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AuthPolicy for FixedCredentials {
    fn evaluate(&self, username: &str, password: &str) -> AuthDecision {
        let user_ok = constant_time_eq(username.as_bytes(), self.username.as_bytes());
        let pass_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
        if user_ok & pass_ok {
            AuthDecision::Accepted
        } else {
            AuthDecision::Rejected
        }
    }

    fn name(&self) -> &'static str {
        "fixed-password"
    }
}
