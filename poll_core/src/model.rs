//! # Poll Data Model
//!
//! The records owned by the Poll Store and the pure state transitions applied
//! to them. Nothing here performs I/O; the transaction closure built by the
//! coordinator calls [`Poll::apply_vote`] and may do so once per retry.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PollError, VoteError};

/// Length of generated short poll ids.
pub const POLL_ID_LEN: usize = 10;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Short, globally unique poll identifier.
    PollId
);
string_id!(
    /// Option identifier, unique within its poll.
    OptionId
);
string_id!(
    /// Opaque voter handle issued by the identity provider.
    VoterId
);

impl PollId {
    /// Generates a random alphanumeric short id.
    pub fn generate() -> Self {
        let id: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(POLL_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: OptionId,
    pub text: String,
    pub vote_count: u64,
}

/// A complete snapshot of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: PollId,
    pub question: String,
    pub options: Vec<PollOption>,
    /// Bumped by exactly 1 per committed vote.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// One voter's recorded choice, keyed by `(poll_id, voter_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub poll_id: PollId,
    pub voter_id: VoterId,
    pub option_id: OptionId,
    pub timestamp: DateTime<Utc>,
}

/// A display row of [`Poll::tally`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyRow {
    pub option_id: OptionId,
    pub text: String,
    pub vote_count: u64,
    pub percentage: u8,
}

impl Poll {
    pub fn option(&self, option_id: &OptionId) -> Option<&PollOption> {
        self.options.iter().find(|o| &o.id == option_id)
    }

    pub fn has_option(&self, option_id: &OptionId) -> bool {
        self.option(option_id).is_some()
    }

    /// Sum of all option counts.
    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|o| o.vote_count).sum()
    }

    /// Per-option counts with their share of the total, rounded to the
    /// nearest percent. All shares are 0 while nobody has voted.
    pub fn tally(&self) -> Vec<TallyRow> {
        let total = self.total_votes();
        self.options
            .iter()
            .map(|o| TallyRow {
                option_id: o.id.clone(),
                text: o.text.clone(),
                vote_count: o.vote_count,
                percentage: if total == 0 {
                    0
                } else {
                    ((o.vote_count as f64 / total as f64) * 100.0).round() as u8
                },
            })
            .collect()
    }

    /// Counts one vote for `option_id` and advances the version.
    pub fn apply_vote(&mut self, option_id: &OptionId) -> Result<(), VoteError> {
        let option = self
            .options
            .iter_mut()
            .find(|o| &o.id == option_id)
            .ok_or(VoteError::InvalidOption)?;
        option.vote_count += 1;
        self.version += 1;
        Ok(())
    }

    /// Checks the creation-time invariants: a non-empty question and at
    /// least two options with distinct ids.
    pub fn validate(&self) -> Result<(), PollError> {
        if self.question.trim().is_empty() {
            return Err(PollError::EmptyQuestion);
        }
        if self.options.len() < 2 {
            return Err(PollError::TooFewOptions(self.options.len()));
        }
        let mut seen = HashSet::with_capacity(self.options.len());
        for option in &self.options {
            if !seen.insert(&option.id) {
                return Err(PollError::DuplicateOption(option.id.to_string()));
            }
        }
        Ok(())
    }
}

/// Raw input of the poll creation flow.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollDraft {
    pub question: String,
    pub options: Vec<String>,
}

impl PollDraft {
    /// Builds a fresh poll: blank options are dropped, the rest trimmed, each
    /// gets a UUID and a zero count.
    pub fn build(self, now: DateTime<Utc>) -> Result<Poll, PollError> {
        let options: Vec<PollOption> = self
            .options
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .map(|text| PollOption {
                id: OptionId(Uuid::new_v4().to_string()),
                text: text.to_string(),
                vote_count: 0,
            })
            .collect();

        let poll = Poll {
            id: PollId::generate(),
            question: self.question.trim().to_string(),
            options,
            version: 0,
            created_at: now,
        };
        poll.validate()?;
        Ok(poll)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A poll with fixed option ids, handy across test modules.
    pub(crate) fn sample_poll(id: &str, options: &[&str]) -> Poll {
        Poll {
            id: PollId::from(id),
            question: "Favourite colour?".to_string(),
            options: options
                .iter()
                .map(|o| PollOption {
                    id: OptionId::from(*o),
                    text: o.to_string(),
                    vote_count: 0,
                })
                .collect(),
            version: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn apply_vote_bumps_count_and_version() {
        let mut poll = sample_poll("p1", &["Red", "Blue"]);
        poll.apply_vote(&OptionId::from("Red")).unwrap();
        poll.apply_vote(&OptionId::from("Red")).unwrap();

        assert_eq!(poll.option(&"Red".into()).unwrap().vote_count, 2);
        assert_eq!(poll.version, 2);
        assert_eq!(poll.total_votes(), 2);
    }

    #[test]
    fn apply_vote_rejects_unknown_option_without_touching_state() {
        let mut poll = sample_poll("p1", &["Red", "Blue"]);
        let before = poll.clone();

        assert_eq!(
            poll.apply_vote(&OptionId::from("Green")),
            Err(VoteError::InvalidOption)
        );
        assert_eq!(poll, before);
    }

    #[test]
    fn draft_trims_and_drops_blank_options() {
        let draft = PollDraft {
            question: "  Lunch?  ".to_string(),
            options: vec![" Pizza ".into(), "   ".into(), "Sushi".into(), "".into()],
        };
        let poll = draft.build(Utc::now()).unwrap();

        assert_eq!(poll.question, "Lunch?");
        assert_eq!(poll.id.as_str().len(), POLL_ID_LEN);
        assert!(poll.id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        let texts: Vec<_> = poll.options.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, ["Pizza", "Sushi"]);
        assert_ne!(poll.options[0].id, poll.options[1].id);
        assert_eq!(poll.version, 0);
    }

    #[test]
    fn draft_needs_two_real_options_and_a_question() {
        let one_option = PollDraft {
            question: "Lunch?".to_string(),
            options: vec!["Pizza".into(), " ".into()],
        };
        assert_eq!(one_option.build(Utc::now()), Err(PollError::TooFewOptions(1)));

        let no_question = PollDraft {
            question: "  ".to_string(),
            options: vec!["Pizza".into(), "Sushi".into()],
        };
        assert_eq!(no_question.build(Utc::now()), Err(PollError::EmptyQuestion));
    }

    #[test]
    fn validate_catches_duplicate_option_ids() {
        let poll = sample_poll("p1", &["Red", "Red"]);
        assert_eq!(
            poll.validate(),
            Err(PollError::DuplicateOption("Red".to_string()))
        );
    }

    #[test]
    fn tally_rounds_percentages() {
        let mut poll = sample_poll("p1", &["A", "B", "C"]);
        assert!(poll.tally().iter().all(|row| row.percentage == 0));

        poll.apply_vote(&"A".into()).unwrap();
        poll.apply_vote(&"A".into()).unwrap();
        poll.apply_vote(&"B".into()).unwrap();

        let shares: Vec<u8> = poll.tally().iter().map(|r| r.percentage).collect();
        assert_eq!(shares, [67, 33, 0]);
    }

    #[test]
    fn snapshot_serializes_in_camel_case() {
        let poll = sample_poll("p1", &["Red", "Blue"]);
        let json = serde_json::to_value(&poll).unwrap();

        assert_eq!(json["id"], "p1");
        assert_eq!(json["options"][0]["voteCount"], 0);
        assert!(json.get("createdAt").is_some());
    }
}
