//! # Core Configuration
//!
//! Tunables for the store, the coordinator's retry loop and the broker. All
//! structs deserialize from the server's JSON config file and fall back to
//! the defaults below for missing fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// `None` selects the in-memory store.
    pub redis_url: Option<String>,
    /// Reconnect attempts of the redis connection manager.
    pub redis_retries: usize,
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_retries: 1,
            connect_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Transactions attempted per vote before giving up with `Contention`.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Wall-clock budget for all attempts of one vote.
    pub retry_budget_ms: u64,
    /// Upper bound for a single store transaction.
    pub store_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_ms: 5,
            backoff_max_ms: 200,
            retry_budget_ms: 2_000,
            store_timeout_ms: 1_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Upper bound of the jittered pause after the `attempt`-th conflict
    /// (1-based): `base * 2^(attempt-1)`, capped at `backoff_max_ms`.
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    /// How long a poll's channel outlives its last viewer.
    pub linger_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { linger_secs: 30 }
    }
}
