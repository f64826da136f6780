//! # In-Memory Poll Store
//!
//! Each poll lives in its own `PollRecord` behind a mutex, together with all
//! of its vote records, so the poll and the vote of a commit always change as
//! one unit. Transactions hold no lock while the decision closure runs: the
//! read and the commit are two separate critical sections and the commit is
//! a compare-and-swap on the poll version and the vote slot.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::errors::{StoreError, VoteError};
use crate::model::{Poll, PollId, Vote, VoterId};
use crate::store::{PollStore, TxnError, TxnView, TxnWrite, check_write};

struct PollRecord {
    poll: Poll,
    votes: HashMap<VoterId, Vote>,
}

#[derive(Default)]
pub struct MemoryPollStore {
    polls: RwLock<HashMap<PollId, Arc<Mutex<PollRecord>>>>,
    /// Artificial pause between read and commit. Widens the race window in
    /// contention tests; `None` in normal use.
    txn_latency: Option<Duration>,
}

impl MemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_txn_latency(latency: Duration) -> Self {
        Self {
            txn_latency: Some(latency),
            ..Self::default()
        }
    }

    fn record(&self, poll_id: &PollId) -> Option<Arc<Mutex<PollRecord>>> {
        let polls = self.polls.read().expect("MemoryPollStore lock poisoned");
        polls.get(poll_id).cloned()
    }
}

impl PollStore for MemoryPollStore {
    async fn get(&self, poll_id: &PollId) -> Result<Poll, StoreError> {
        let record = self.record(poll_id).ok_or(StoreError::NotFound)?;
        let guard = record.lock().expect("PollRecord lock poisoned");
        Ok(guard.poll.clone())
    }

    async fn get_vote(&self, poll_id: &PollId, voter_id: &VoterId) -> Result<Vote, StoreError> {
        let record = self.record(poll_id).ok_or(StoreError::NotFound)?;
        let guard = record.lock().expect("PollRecord lock poisoned");
        guard.votes.get(voter_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
        let mut polls = self.polls.write().expect("MemoryPollStore lock poisoned");
        match polls.entry(poll.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(poll.id.to_string())),
            Entry::Vacant(slot) => {
                tracing::debug!(poll_id = %poll.id, options = poll.options.len(), "poll stored");
                slot.insert(Arc::new(Mutex::new(PollRecord {
                    poll,
                    votes: HashMap::new(),
                })));
                Ok(())
            }
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
        let record = self.record(poll_id);

        let view = match &record {
            Some(record) => {
                let guard = record.lock().expect("PollRecord lock poisoned");
                TxnView {
                    poll: Some(guard.poll.clone()),
                    vote: guard.votes.get(voter_id).cloned(),
                }
            }
            None => TxnView {
                poll: None,
                vote: None,
            },
        };
        let read_version = view.poll.as_ref().map(|p| p.version);

        if let Some(latency) = self.txn_latency {
            tokio::time::sleep(latency).await;
        }

        let write = decide(view).map_err(TxnError::Aborted)?;
        let (Some(record), Some(read_version)) = (record, read_version) else {
            return Err(StoreError::NotFound.into());
        };
        check_write(poll_id, voter_id, read_version, &write)?;

        let mut guard = record.lock().expect("PollRecord lock poisoned");
        if guard.poll.version != read_version || guard.votes.contains_key(voter_id) {
            return Err(StoreError::Conflict.into());
        }

        guard.poll = write.poll;
        guard.votes.insert(voter_id.clone(), write.vote);
        Ok(guard.poll.clone())
    }

    async fn count_votes(&self, poll_id: &PollId) -> Result<u64, StoreError> {
        let record = self.record(poll_id).ok_or(StoreError::NotFound)?;
        let guard = record.lock().expect("PollRecord lock poisoned");
        Ok(guard.votes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_poll;
    use crate::model::OptionId;
    use chrono::Utc;

    fn vote_for(view: TxnView, voter: &str, option: &str) -> Result<TxnWrite, VoteError> {
        let mut poll = view.poll.ok_or(VoteError::PollNotFound)?;
        poll.apply_vote(&OptionId::from(option))?;
        Ok(TxnWrite {
            vote: Vote {
                poll_id: poll.id.clone(),
                voter_id: VoterId::from(voter),
                option_id: OptionId::from(option),
                timestamp: Utc::now(),
            },
            poll,
        })
    }

    #[tokio::test]
    async fn transact_commits_poll_and_vote_together() {
        let store = MemoryPollStore::new();
        store.insert(sample_poll("p1", &["Red", "Blue"])).await.unwrap();

        let poll = store
            .transact(&"p1".into(), &"v1".into(), |view| vote_for(view, "v1", "Red"))
            .await
            .unwrap();

        assert_eq!(poll.version, 1);
        assert_eq!(store.get(&"p1".into()).await.unwrap(), poll);
        let vote = store.get_vote(&"p1".into(), &"v1".into()).await.unwrap();
        assert_eq!(vote.option_id, OptionId::from("Red"));
        assert_eq!(store.count_votes(&"p1".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn aborted_transaction_writes_nothing() {
        let store = MemoryPollStore::new();
        store.insert(sample_poll("p1", &["Red", "Blue"])).await.unwrap();

        let err = store
            .transact(&"p1".into(), &"v1".into(), |view| vote_for(view, "v1", "Green"))
            .await
            .unwrap_err();

        assert_eq!(err, TxnError::Aborted(VoteError::InvalidOption));
        assert_eq!(store.get(&"p1".into()).await.unwrap().version, 0);
        assert_eq!(
            store.get_vote(&"p1".into(), &"v1".into()).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn stale_read_loses_to_earlier_commit() {
        let store = Arc::new(MemoryPollStore::with_txn_latency(Duration::from_millis(50)));
        store.insert(sample_poll("p1", &["Red", "Blue"])).await.unwrap();

        let slow = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .transact(&"p1".into(), &"slow".into(), |view| vote_for(view, "slow", "Red"))
                    .await
            })
        };
        // Let the slow transaction take its read first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fast = store
            .transact(&"p1".into(), &"fast".into(), |view| vote_for(view, "fast", "Blue"))
            .await;

        // Both read version 0. The slow read commits first, so the fast one is stale.
        let slow = slow.await.unwrap();
        assert!(slow.is_ok());
        assert_eq!(fast, Err(TxnError::Store(StoreError::Conflict)));
        assert_eq!(store.get(&"p1".into()).await.unwrap().version, 1);
        assert_eq!(store.count_votes(&"p1".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn write_skipping_a_version_is_refused() {
        let store = MemoryPollStore::new();
        store.insert(sample_poll("p1", &["Red", "Blue"])).await.unwrap();

        let err = store
            .transact(&"p1".into(), &"v1".into(), |view| {
                let mut write = vote_for(view, "v1", "Red")?;
                write.poll.version += 1;
                Ok(write)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::Store(StoreError::InvalidWrite(_))));

        let err = store
            .transact(&"p1".into(), &"v1".into(), |view| vote_for(view, "someone-else", "Red"))
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::Store(StoreError::InvalidWrite(_))));

        assert_eq!(store.get(&"p1".into()).await.unwrap().version, 0);
        assert_eq!(store.count_votes(&"p1".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_poll_is_reported_to_the_closure() {
        let store = MemoryPollStore::new();
        let err = store
            .transact(&"nope".into(), &"v1".into(), |view| vote_for(view, "v1", "Red"))
            .await
            .unwrap_err();
        assert_eq!(err, TxnError::Aborted(VoteError::PollNotFound));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = MemoryPollStore::new();
        store.insert(sample_poll("p1", &["Red", "Blue"])).await.unwrap();
        assert_eq!(
            store.insert(sample_poll("p1", &["A", "B"])).await,
            Err(StoreError::AlreadyExists("p1".to_string()))
        );
    }
}
