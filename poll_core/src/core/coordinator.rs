//! # Vote Coordinator
//!
//! Owns the optimistic-concurrency retry loop around [`PollStore::transact`].
//! A vote is decided by a pure closure against a consistent `(poll, vote)`
//! read; a lost race (`Conflict`) re-runs the whole transaction after a
//! jittered pause until it commits, the caller gets a definite answer, or the
//! attempt count / wall-clock budget runs out (`Contention`).
//!
//! Every committed snapshot is handed to the [`SubscriptionBroker`] before the
//! caller sees it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::{Instant, sleep, timeout};

use crate::config::CoordinatorConfig;
use crate::core::broker::SubscriptionBroker;
use crate::errors::{PollError, StoreError, VoteError};
use crate::identity::IdentityProvider;
use crate::model::{OptionId, Poll, PollDraft, PollId, Vote, VoterId};
use crate::store::{PollStore, TxnError, TxnView, TxnWrite};

/// Fresh ids tried when a generated poll id is already taken.
const CREATE_ATTEMPTS: usize = 3;

pub struct VoteCoordinator<S> {
    store: Arc<S>,
    broker: Arc<SubscriptionBroker<S>>,
    config: CoordinatorConfig,
}

impl<S: PollStore> VoteCoordinator<S> {
    pub fn new(store: Arc<S>, broker: Arc<SubscriptionBroker<S>>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<SubscriptionBroker<S>> {
        &self.broker
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Validates and stores a new poll.
    pub async fn create_poll(&self, draft: PollDraft) -> Result<Poll, PollError> {
        let mut poll = draft.build(Utc::now())?;
        let mut attempt = 1;
        loop {
            match self.store.insert(poll.clone()).await {
                Ok(()) => {
                    tracing::info!(poll_id = %poll.id, options = poll.options.len(), "Poll created");
                    return Ok(poll);
                }
                Err(StoreError::AlreadyExists(_)) if attempt < CREATE_ATTEMPTS => {
                    attempt += 1;
                    poll.id = PollId::generate();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current authoritative snapshot of a poll.
    pub async fn poll(&self, poll_id: &PollId) -> Result<Poll, VoteError> {
        self.store.get(poll_id).await.map_err(not_found_as_poll)
    }

    /// The vote a voter already cast on a poll, if any.
    pub async fn existing_vote(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
    ) -> Result<Option<Vote>, VoteError> {
        match self.store.get_vote(poll_id, voter_id).await {
            Ok(vote) => Ok(Some(vote)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(VoteError::Store(e)),
        }
    }

    /// Resolves the voter through `identity` and submits the vote. Without an
    /// identity nothing touches the store.
    pub async fn vote_as<I>(
        &self,
        identity: &I,
        poll_id: &PollId,
        option_id: &OptionId,
    ) -> Result<Arc<Poll>, VoteError>
    where
        I: IdentityProvider + ?Sized,
    {
        let voter_id = identity.current_identity()?;
        self.submit_vote(poll_id, &voter_id, option_id).await
    }

    /// Records one vote and returns the committed snapshot.
    pub async fn submit_vote(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
        option_id: &OptionId,
    ) -> Result<Arc<Poll>, VoteError> {
        self.precheck(poll_id, option_id).await?;

        let started = Instant::now();
        let budget = self.config.retry_budget();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.attempt(poll_id, voter_id, option_id).await {
                Ok(poll) => {
                    let snapshot = Arc::new(poll);
                    tracing::debug!(
                        %poll_id, %voter_id, %option_id,
                        version = snapshot.version, attempt,
                        "Vote committed"
                    );
                    self.broker.publish(poll_id, Arc::clone(&snapshot));
                    return Ok(snapshot);
                }
                Err(TxnError::Aborted(err)) => return Err(err),
                Err(TxnError::Store(StoreError::Conflict)) => {
                    tracing::trace!(%poll_id, %voter_id, attempt, "Vote lost a commit race");

                    let elapsed = started.elapsed();
                    if attempt >= self.config.max_attempts || elapsed >= budget {
                        tracing::warn!(
                            %poll_id, %voter_id, attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Retry budget exhausted"
                        );
                        return Err(VoteError::Contention);
                    }

                    let pause = jittered(self.config.backoff_cap(attempt));
                    sleep(pause.min(budget - elapsed)).await;
                }
                Err(TxnError::Store(err)) => return Err(not_found_as_poll(err)),
            }
        }
    }

    /// Cheap early rejection of unknown options against the newest snapshot
    /// at hand. Any doubt is left to the transaction.
    async fn precheck(&self, poll_id: &PollId, option_id: &OptionId) -> Result<(), VoteError> {
        let known = match self.broker.latest(poll_id) {
            Some(snapshot) => snapshot,
            None => match timeout(self.config.store_timeout(), self.store.get(poll_id)).await {
                Ok(Ok(poll)) => Arc::new(poll),
                _ => return Ok(()),
            },
        };
        if known.has_option(option_id) {
            Ok(())
        } else {
            Err(VoteError::InvalidOption)
        }
    }

    async fn attempt(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
        option_id: &OptionId,
    ) -> Result<Poll, TxnError> {
        let now = Utc::now();
        let voter = voter_id.clone();
        let option = option_id.clone();
        let txn = self
            .store
            .transact(poll_id, voter_id, move |view| decide_vote(view, voter, option, now));

        match timeout(self.config.store_timeout(), txn).await {
            Ok(result) => result,
            Err(_) => {
                // Only the reply may have been lost; viewers must not miss
                // a commit that did land.
                self.republish(poll_id).await;
                Err(StoreError::Unavailable("transaction timed out".to_string()).into())
            }
        }
    }

    /// Best-effort publish of the stored snapshot after an unanswered commit.
    async fn republish(&self, poll_id: &PollId) {
        match timeout(self.config.store_timeout(), self.store.get(poll_id)).await {
            Ok(Ok(poll)) => {
                tracing::debug!(%poll_id, version = poll.version, "Republishing after timed out transaction");
                self.broker.publish(poll_id, Arc::new(poll));
            }
            Ok(Err(e)) => tracing::debug!(%poll_id, error = %e, "Re-read after timed out transaction failed"),
            Err(_) => tracing::debug!(%poll_id, "Re-read after timed out transaction timed out"),
        }
    }
}

/// The transaction body. The existing-vote check comes first so a repeat
/// voter always learns their prior choice.
fn decide_vote(
    view: TxnView,
    voter_id: VoterId,
    option_id: OptionId,
    now: DateTime<Utc>,
) -> Result<TxnWrite, VoteError> {
    if let Some(existing) = view.vote {
        return Err(VoteError::AlreadyVoted {
            option_id: existing.option_id,
        });
    }
    let mut poll = view.poll.ok_or(VoteError::PollNotFound)?;
    poll.apply_vote(&option_id)?;

    Ok(TxnWrite {
        vote: Vote {
            poll_id: poll.id.clone(),
            voter_id,
            option_id,
            timestamp: now,
        },
        poll,
    })
}

fn jittered(cap: Duration) -> Duration {
    let cap_ms = cap.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=cap_ms))
}

fn not_found_as_poll(err: StoreError) -> VoteError {
    match err {
        StoreError::NotFound => VoteError::PollNotFound,
        other => VoteError::Store(other),
    }
}
