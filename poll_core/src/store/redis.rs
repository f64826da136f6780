//! # Redis Poll Store
//!
//! Key layout:
//!
//! - `poll:{id}`: the poll snapshot as JSON
//! - `poll:{id}:vote:{voter}`: one vote record as JSON
//! - `poll:{id}:voters`: set of voter ids, used for counting
//!
//! The read half of a transaction is a single `MGET`. The commit half is one
//! Lua script that re-checks the stored version and the vote key and then
//! writes all three keys; Redis runs scripts atomically, so a partial commit
//! is never visible.

use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};

use crate::config::StoreConfig;
use crate::errors::{StoreError, VoteError};
use crate::model::{Poll, PollId, Vote, VoterId};
use crate::store::{PollStore, TxnError, TxnView, TxnWrite, check_write};

const COMMIT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 'missing'
end
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 'conflict'
end
local stored = cjson.decode(current)
if tonumber(stored['version']) ~= tonumber(ARGV[1]) then
  return 'conflict'
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[4])
return 'ok'
"#;

pub(crate) fn poll_key(poll_id: &PollId) -> String {
    format!("poll:{poll_id}")
}

pub(crate) fn vote_key(poll_id: &PollId, voter_id: &VoterId) -> String {
    format!("poll:{poll_id}:vote:{voter_id}")
}

pub(crate) fn voters_key(poll_id: &PollId) -> String {
    format!("poll:{poll_id}:voters")
}

#[derive(Clone)]
pub struct RedisPollStore {
    connection: ConnectionManager,
    commit: Script,
}

impl RedisPollStore {
    /// Connects with bounded retries so a dead server fails fast instead of
    /// stalling the vote path.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("no redis url configured".to_string()))?;

        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.redis_retries)
            .set_connection_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));

        let client = Client::open(url)?;
        let connection = client
            .get_connection_manager_with_config(manager_config)
            .await?;
        tracing::info!("Connected to redis poll store");

        Ok(Self {
            connection,
            commit: Script::new(COMMIT_SCRIPT),
        })
    }
}

impl PollStore for RedisPollStore {
    async fn get(&self, poll_id: &PollId) -> Result<Poll, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(poll_key(poll_id)).await?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn get_vote(&self, poll_id: &PollId, voter_id: &VoterId) -> Result<Vote, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(vote_key(poll_id, voter_id)).await?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&poll)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(poll_key(&poll.id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        match created {
            Some(_) => Ok(()),
            None => Err(StoreError::AlreadyExists(poll.id.to_string())),
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
        let mut conn = self.connection.clone();
        let (raw_poll, raw_vote): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(poll_key(poll_id))
            .arg(vote_key(poll_id, voter_id))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        let view = TxnView {
            poll: raw_poll
                .map(|raw| serde_json::from_str::<Poll>(&raw))
                .transpose()
                .map_err(StoreError::from)?,
            vote: raw_vote
                .map(|raw| serde_json::from_str::<Vote>(&raw))
                .transpose()
                .map_err(StoreError::from)?,
        };
        let Some(read_version) = view.poll.as_ref().map(|p| p.version) else {
            // The closure still gets to report an existing vote first.
            return match decide(view) {
                Err(err) => Err(TxnError::Aborted(err)),
                Ok(_) => Err(StoreError::NotFound.into()),
            };
        };

        let write = decide(view).map_err(TxnError::Aborted)?;
        check_write(poll_id, voter_id, read_version, &write)?;
        let poll_json = serde_json::to_string(&write.poll).map_err(StoreError::from)?;
        let vote_json = serde_json::to_string(&write.vote).map_err(StoreError::from)?;

        let outcome: String = self
            .commit
            .key(poll_key(poll_id))
            .key(vote_key(poll_id, voter_id))
            .key(voters_key(poll_id))
            .arg(read_version)
            .arg(poll_json)
            .arg(vote_json)
            .arg(voter_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        match outcome.as_str() {
            "ok" => Ok(write.poll),
            "conflict" => Err(StoreError::Conflict.into()),
            "missing" => Err(StoreError::NotFound.into()),
            other => Err(StoreError::Unavailable(format!("unexpected commit reply {other}")).into()),
        }
    }

    async fn count_votes(&self, poll_id: &PollId) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        Ok(conn.scard(voters_key(poll_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_poll;
    use crate::model::OptionId;
    use chrono::Utc;

    #[test]
    fn keys_are_namespaced_per_poll() {
        let poll: PollId = "abc".into();
        let voter: VoterId = "v1".into();
        assert_eq!(poll_key(&poll), "poll:abc");
        assert_eq!(vote_key(&poll, &voter), "poll:abc:vote:v1");
        assert_eq!(voters_key(&poll), "poll:abc:voters");
    }

    /// Needs a live server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn commit_script_rejects_second_vote() {
        let config = StoreConfig {
            redis_url: std::env::var("REDIS_URL").ok(),
            ..StoreConfig::default()
        };
        let store = RedisPollStore::connect(&config).await.unwrap();
        let mut poll = sample_poll("", &["Red", "Blue"]);
        poll.id = PollId::generate();
        let poll_id = poll.id.clone();
        store.insert(poll).await.unwrap();

        let voter: VoterId = "v1".into();
        let decide = |view: TxnView| {
            if let Some(vote) = view.vote {
                return Err(VoteError::AlreadyVoted { option_id: vote.option_id });
            }
            let mut poll = view.poll.ok_or(VoteError::PollNotFound)?;
            poll.apply_vote(&OptionId::from("Red"))?;
            Ok(TxnWrite {
                vote: Vote {
                    poll_id: poll.id.clone(),
                    voter_id: "v1".into(),
                    option_id: "Red".into(),
                    timestamp: Utc::now(),
                },
                poll,
            })
        };

        let committed = store.transact(&poll_id, &voter, decide).await.unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(
            store.transact(&poll_id, &voter, decide).await,
            Err(TxnError::Aborted(VoteError::AlreadyVoted { option_id: "Red".into() }))
        );
        assert_eq!(store.count_votes(&poll_id).await.unwrap(), 1);
    }
}
