use poll_core::{OptionId, Poll, PollDraft, PollId, TallyRow};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
}

impl From<CreatePollRequest> for PollDraft {
    fn from(request: CreatePollRequest) -> Self {
        PollDraft {
            question: request.question,
            options: request.options,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub option_id: OptionId,
}

/// A poll as the front end renders it.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub id: PollId,
    pub question: String,
    pub version: u64,
    pub total_votes: u64,
    pub tally: Vec<TallyRow>,
    /// The requesting voter's prior choice, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_vote: Option<OptionId>,
}

impl PollView {
    pub fn new(poll: &Poll, your_vote: Option<OptionId>) -> Self {
        Self {
            id: poll.id.clone(),
            question: poll.question.clone(),
            version: poll.version,
            total_votes: poll.total_votes(),
            tally: poll.tally(),
            your_vote,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExistingVoteResponse {
    pub option_id: Option<OptionId>,
}

/// Frames pushed over the live WebSocket.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Snapshot { poll: PollView },
    Error { message: String },
}
