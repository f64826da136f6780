//! # Error Taxonomy
//!
//! Every failure the core can report. `StoreError::Conflict` is the only
//! transient kind; the coordinator absorbs it and it never reaches a caller
//! of `submit_vote`.

use thiserror::Error;

use crate::model::OptionId;

/// Failures reported by a [`PollStore`](crate::store::PollStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The poll (or vote) key is absent.
    #[error("key not found")]
    NotFound,

    /// Another writer committed between this transaction's read and its commit.
    #[error("optimistic concurrency conflict")]
    Conflict,

    /// A poll with the same id already exists.
    #[error("poll {0} already exists")]
    AlreadyExists(String),

    /// The backend did not answer in time or refused the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A transaction proposed writes that do not fit the record it read.
    #[error("rejected write: {0}")]
    InvalidWrite(String),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Outcomes of `submit_vote` other than a committed snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("poll not found")]
    PollNotFound,

    /// The voter already has a recorded vote; carries the prior choice.
    #[error("already voted for option {option_id}")]
    AlreadyVoted { option_id: OptionId },

    #[error("option is not part of this poll")]
    InvalidOption,

    /// Retry budget exhausted. Safe to try again.
    #[error("too much contention on this poll, try again")]
    Contention,

    #[error("no voter identity available")]
    Unauthenticated,

    #[error(transparent)]
    Store(StoreError),
}

impl VoteError {
    /// Whether the caller may resubmit the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VoteError::Contention | VoteError::Store(StoreError::Unavailable(_))
        )
    }
}

/// Failure of the identity collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no identity has been established yet")]
    Unauthenticated,
}

impl From<IdentityError> for VoteError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unauthenticated => VoteError::Unauthenticated,
        }
    }
}

/// Rejections of a poll at creation or validation time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("a poll needs at least 2 options, got {0}")]
    TooFewOptions(usize),

    #[error("duplicate option id {0}")]
    DuplicateOption(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
