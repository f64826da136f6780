//! # poll_core
//!
//! Vote consistency and live tally propagation for anonymous, single-choice
//! polls.
//!
//! - **`store`**: authoritative `Poll`/`Vote` storage with compare-and-swap
//!   transactions (in-memory, or Redis with feature `redis-store`).
//! - **`core`**: the Vote Coordinator (optimistic retry loop) and the
//!   Subscription Broker (per-poll fan-out of committed snapshots).
//! - **`identity`**: the seam through which a pre-authenticated voter id
//!   reaches the core.
//! - **`loggers`** (feature `loggers`): process-wide tracing bootstrap.
//!
//! A voter is counted at most once per poll, every committed vote moves the
//! poll's `version` forward by exactly one, and viewers never see a tally
//! older than one they were already shown.

#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod errors;
pub mod identity;
pub mod model;
pub mod store;

#[cfg(feature = "loggers")]
pub mod loggers;

pub use config::{BrokerConfig, CoordinatorConfig, StoreConfig};
pub use self::core::{Subscription, SubscriptionBroker, SubscriptionId, VoteCoordinator};
pub use errors::{IdentityError, PollError, StoreError, VoteError};
pub use identity::{FixedIdentity, IdentityProvider, NoIdentity};
pub use model::{OptionId, Poll, PollDraft, PollId, PollOption, TallyRow, Vote, VoterId};
pub use store::{MemoryPollStore, PollStore};
#[cfg(feature = "redis-store")]
pub use store::RedisPollStore;
