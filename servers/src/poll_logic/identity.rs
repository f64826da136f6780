use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use poll_core::{IdentityError, IdentityProvider, VoterId};

/// Header carrying the pre-authenticated voter token.
pub const VOTER_HEADER: &str = "x-voter-id";

/// The voter identity sent along with a request, if any. Absent or blank
/// headers leave the request unauthenticated.
#[derive(Debug, Clone, Default)]
pub struct HeaderIdentity(Option<VoterId>);

impl HeaderIdentity {
    pub fn voter(&self) -> Option<&VoterId> {
        self.0.as_ref()
    }
}

impl IdentityProvider for HeaderIdentity {
    fn current_identity(&self) -> Result<VoterId, IdentityError> {
        self.0.clone().ok_or(IdentityError::Unauthenticated)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for HeaderIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let voter = parts
            .headers
            .get(VOTER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(VoterId::from);
        Ok(HeaderIdentity(voter))
    }
}
