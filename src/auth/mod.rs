//! # Caller Identity
//!
//! Request-scoped authentication context. Every mutating or
//! plaintext-revealing storage operation requires a resolvable caller
//! identity; its absence is a hard precondition failure rather than a soft
//! default.

use std::fmt::{self, Display, Formatter};

use crate::errors::{KeepsakeError, Result};

/// Kind of principal a request acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityType {
    User,
    ServiceAccount,
}

impl IdentityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ServiceAccount => "service_account",
        }
    }
}

impl Display for IdentityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub identity_type: IdentityType,
}

impl Identity {
    pub fn user(uid: impl Into<String>) -> Self {
        Self { uid: uid.into(), identity_type: IdentityType::User }
    }

    pub fn service_account(uid: impl Into<String>) -> Self {
        Self { uid: uid.into(), identity_type: IdentityType::ServiceAccount }
    }
}

/// Request-scoped context carried into every storage operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    identity: Option<Identity>,
}

impl RequestContext {
    /// A context with no caller identity. Any operation that requires auth
    /// will fail against it.
    pub fn anonymous() -> Self {
        Self { identity: None }
    }

    /// A context acting as the given identity.
    pub fn authenticated(identity: Identity) -> Self {
        Self { identity: Some(identity) }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Return the caller identity or fail with `Unauthenticated`.
    pub fn require_auth(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| KeepsakeError::unauthenticated("missing caller identity in context"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_auth_passes_with_identity() {
        let ctx = RequestContext::authenticated(Identity::user("u-1"));
        let identity = ctx.require_auth().unwrap();
        assert_eq!(identity.uid, "u-1");
        assert_eq!(identity.identity_type, IdentityType::User);
    }

    #[test]
    fn require_auth_fails_anonymous() {
        let ctx = RequestContext::anonymous();
        let err = ctx.require_auth().unwrap_err();
        assert!(matches!(err, KeepsakeError::Unauthenticated { .. }));
    }

    #[test]
    fn identity_type_display() {
        assert_eq!(IdentityType::User.to_string(), "user");
        assert_eq!(IdentityType::ServiceAccount.to_string(), "service_account");
    }
}
