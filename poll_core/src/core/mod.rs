//! # Voting Core
//!
//! The two live components sitting on top of a [`PollStore`](crate::store::PollStore).
//! Neither holds authoritative state; the store owns every `Poll` and `Vote`.
//!
//! ## Components:
//!
//! - **`coordinator`**: turns a vote request into a store transaction,
//!   retries lost commit races with jittered backoff and reports the
//!   definite outcome. Every commit is handed to the broker.
//!
//! - **`broker`**: keeps one watch channel per watched poll and fans each
//!   committed snapshot out to that poll's viewers, newest version wins.
//!   Channels linger briefly after the last viewer leaves so a quick
//!   reconnect does not cost a store read.

/// Per-poll fan-out of committed snapshots.
pub mod broker;
/// The optimistic-concurrency vote loop.
pub mod coordinator;

pub use broker::{Subscription, SubscriptionBroker, SubscriptionId};
pub use coordinator::VoteCoordinator;
