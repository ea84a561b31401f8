//! Poll lifecycle payloads: start, vote, and end events.

use serde::{Deserialize, Serialize};

/// One selectable option as shown to participants.
///
/// Deliberately excludes the correctness flag and tally: those are only
/// revealed in [`PollResults`] once the poll closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptionInfo {
    /// Option identifier, unique within the poll
    pub option_id: u64,
    /// Display text
    pub text: String,
}

/// Full poll description broadcast in a `start_poll` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSnapshot {
    /// Poll identifier
    pub poll_id: u64,
    /// Room the poll runs in
    pub room_id: String,
    /// Question text
    pub question: String,
    /// Options in display (creation) order
    pub options: Vec<PollOptionInfo>,
    /// Voting window length in seconds
    pub duration_secs: u64,
}

/// Vote payload, used in both directions.
///
/// Inbound (client to server) `voter_id` is ignored: the server uses the
/// connection's session identity. Outbound broadcasts carry the recorded
/// voter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotePayload {
    /// Poll being voted on
    pub poll_id: u64,
    /// Chosen option
    pub option_id: u64,
    /// Seconds the participant took to answer
    pub time_to_answer_secs: f64,
    /// Recorded voter; filled by the server on broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voter_id: Option<u64>,
}

/// Final standing of one option, revealed when the poll closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionResult {
    /// Option identifier
    pub option_id: u64,
    /// Display text
    pub text: String,
    /// Whether this was the correct answer
    pub is_correct: bool,
    /// Accepted votes for this option
    pub votes: u64,
    /// Share of the total vote as a percentage; 0.0 when no votes were
    /// cast at all
    pub percentage: f64,
}

/// Final results broadcast in an `end_poll` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResults {
    /// Poll identifier
    pub poll_id: u64,
    /// Total accepted votes across all options
    pub total_votes: u64,
    /// Per-option results in display (creation) order
    pub options: Vec<OptionResult>,
}
