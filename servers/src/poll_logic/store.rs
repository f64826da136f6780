//! Store backend picked at startup from the configuration.

use poll_core::errors::{StoreError, VoteError};
use poll_core::model::{Poll, PollId, Vote, VoterId};
use poll_core::store::{MemoryPollStore, PollStore, RedisPollStore, TxnError, TxnView, TxnWrite};
use poll_core::StoreConfig;

pub enum AnyStore {
    Memory(MemoryPollStore),
    Redis(RedisPollStore),
}

impl AnyStore {
    pub async fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        match config.redis_url {
            Some(_) => Ok(AnyStore::Redis(RedisPollStore::connect(config).await?)),
            None => {
                tracing::warn!("No redis url configured, polls live in memory only");
                Ok(AnyStore::Memory(MemoryPollStore::new()))
            }
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            AnyStore::Memory(_) => "memory",
            AnyStore::Redis(_) => "redis",
        }
    }
}

impl PollStore for AnyStore {
    async fn get(&self, poll_id: &PollId) -> Result<Poll, StoreError> {
        match self {
            AnyStore::Memory(store) => store.get(poll_id).await,
            AnyStore::Redis(store) => store.get(poll_id).await,
        }
    }

    async fn get_vote(&self, poll_id: &PollId, voter_id: &VoterId) -> Result<Vote, StoreError> {
        match self {
            AnyStore::Memory(store) => store.get_vote(poll_id, voter_id).await,
            AnyStore::Redis(store) => store.get_vote(poll_id, voter_id).await,
        }
    }

    async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(store) => store.insert(poll).await,
            AnyStore::Redis(store) => store.insert(poll).await,
        }
    }

    async fn transact<F>(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
        decide: F,
    ) -> Result<Poll, TxnError>
    where
        F: FnOnce(TxnView) -> Result<TxnWrite, VoteError> + Send,
    {
        match self {
            AnyStore::Memory(store) => store.transact(poll_id, voter_id, decide).await,
            AnyStore::Redis(store) => store.transact(poll_id, voter_id, decide).await,
        }
    }

    async fn count_votes(&self, poll_id: &PollId) -> Result<u64, StoreError> {
        match self {
            AnyStore::Memory(store) => store.count_votes(poll_id).await,
            AnyStore::Redis(store) => store.count_votes(poll_id).await,
        }
    }
}
