//! # Identity Provider
//!
//! Voter identities are issued elsewhere; the core only asks for the current
//! one. A provider with nothing to offer must say so. The core never makes up
//! a fallback identity.

use crate::errors::IdentityError;
use crate::model::VoterId;

pub trait IdentityProvider {
    fn current_identity(&self) -> Result<VoterId, IdentityError>;
}

/// Always answers with the same voter.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub VoterId);

impl IdentityProvider for FixedIdentity {
    fn current_identity(&self) -> Result<VoterId, IdentityError> {
        Ok(self.0.clone())
    }
}

/// A session that has not signed in yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

impl IdentityProvider for NoIdentity {
    fn current_identity(&self) -> Result<VoterId, IdentityError> {
        Err(IdentityError::Unauthenticated)
    }
}

impl<T: IdentityProvider + ?Sized> IdentityProvider for &T {
    fn current_identity(&self) -> Result<VoterId, IdentityError> {
        (**self).current_identity()
    }
}

impl IdentityProvider for Option<VoterId> {
    fn current_identity(&self) -> Result<VoterId, IdentityError> {
        self.clone().ok_or(IdentityError::Unauthenticated)
    }
}
