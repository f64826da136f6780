//! # Poll Store
//!
//! Authoritative storage for `Poll` and `Vote` records. The only way to mutate
//! a poll after creation is [`PollStore::transact`], which runs a pure
//! decision closure against a consistent read of the `(poll, vote)` pair and
//! commits its writes only if neither record changed in between
//! (first committer wins).
//!
//! ## Implementations
//!
//! - **`memory`**: process-local, per-poll compare-and-swap.
//! - **`redis`** (feature `redis-store`): one Lua script per commit so the
//!   poll and vote keys are written as a single atomic unit.

use std::future::Future;

use crate::errors::{StoreError, VoteError};
use crate::model::{Poll, PollId, Vote, VoterId};

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::MemoryPollStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisPollStore;

/// The consistent read handed to a transaction closure.
#[derive(Debug, Clone)]
pub struct TxnView {
    pub poll: Option<Poll>,
    pub vote: Option<Vote>,
}

/// The writes a transaction closure proposes.
#[derive(Debug, Clone)]
pub struct TxnWrite {
    pub poll: Poll,
    pub vote: Vote,
}

/// Why a transaction did not commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// The closure declined to write.
    Aborted(VoteError),
    /// The store refused the commit.
    Store(StoreError),
}

/// Rejects proposed writes that are not a single vote by `voter_id` on top of
/// the poll read at `read_version`.
pub(crate) fn check_write(
    poll_id: &PollId,
    voter_id: &VoterId,
    read_version: u64,
    write: &TxnWrite,
) -> Result<(), StoreError> {
    if &write.poll.id != poll_id || &write.vote.poll_id != poll_id {
        return Err(StoreError::InvalidWrite(format!("write targets poll {}", write.poll.id)));
    }
    if &write.vote.voter_id != voter_id {
        return Err(StoreError::InvalidWrite(format!("vote belongs to {}", write.vote.voter_id)));
    }
    if write.poll.version != read_version + 1 {
        return Err(StoreError::InvalidWrite(format!(
            "version {} does not follow {read_version}",
            write.poll.version
        )));
    }
    Ok(())
}

impl From<StoreError> for TxnError {
    fn from(err: StoreError) -> Self {
        TxnError::Store(err)
    }
}

pub trait PollStore: Send + Sync + 'static {
    fn get(&self, poll_id: &PollId) -> impl Future<Output = Result<Poll, StoreError>> + Send;

    fn get_vote(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
    ) -> impl Future<Output = Result<Vote, StoreError>> + Send;

    /// Stores a freshly created poll. Fails with `AlreadyExists` on an id clash.
    fn insert(&self, poll: Poll) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads `(poll, vote)`, runs `decide`, and atomically persists the
    /// returned poll and vote if both keys are unchanged since the read.
    ///
    /// `decide` must be pure; callers retry the whole transaction on
    /// `StoreError::Conflict`. Returns the committed poll.
    fn transact<F>(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
        decide: F,
    ) -> impl Future<Output = Result<Poll, TxnError>> + Send
    where
        F: FnOnce(TxnView) -> Result<TxnWrite, VoteError> + Send;

    /// Number of vote records held for a poll.
    fn count_votes(&self, poll_id: &PollId) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
