//! Caller identity.

use crate::{PbenchError, Result};
use std::collections::HashMap;

/// Verifies a bearer credential and names the user it belongs to.
pub trait IdentityProvider: Send + Sync {
    /// Return the user id for a credential, or fail with `Unauthorized`.
    fn verify(&self, credential: &str) -> Result<String>;
}

/// Fixed token table, for single-tenant hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIdentity {
    tokens: HashMap<String, String>,
}

impl StaticTokenIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

impl IdentityProvider for StaticTokenIdentity {
    fn verify(&self, credential: &str) -> Result<String> {
        let token = credential
            .strip_prefix("Bearer ")
            .unwrap_or(credential)
            .trim();
        if token.is_empty() {
            return Err(PbenchError::Unauthorized {
                message: "missing credential".to_string(),
            });
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| PbenchError::Unauthorized {
                message: "credential not recognized".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify() {
        let identity = StaticTokenIdentity::new().with_token("t0k3n", "drb");
        assert_eq!(identity.verify("t0k3n").unwrap(), "drb");
        assert_eq!(identity.verify("Bearer t0k3n").unwrap(), "drb");
        assert!(matches!(
            identity.verify("nope"),
            Err(PbenchError::Unauthorized { .. })
        ));
        assert!(matches!(
            identity.verify("Bearer "),
            Err(PbenchError::Unauthorized { .. })
        ));
    }
}
