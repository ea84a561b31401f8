//! Poll lifecycle state machine.
//!
//! Owns option tallies, vote deduplication, and the lifecycle state. Uses
//! the action pattern: methods take time as input and return values for
//! the driver to act on, which keeps the machine pure (no I/O, no timers)
//! and makes the concurrency-sensitive transitions trivially testable.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  activate   ┌────────┐  close (explicit or timer)  ┌────────┐
//! │ Pending │────────────>│ Active │────────────────────────────>│ Closed │
//! └─────────┘             └────────┘                             └────────┘
//! ```
//!
//! `Closed` is terminal. The Active → Closed transition happens exactly
//! once: [`Poll::close`] reports whether the caller performed it, so the
//! loser of a timer-vs-explicit-close race observes the new state and
//! exits silently.

use std::{
    collections::HashMap,
    ops::{Add, Sub},
    time::{Duration, Instant},
};

use pollcast_proto::payloads::poll::{OptionResult, PollOptionInfo, PollResults, PollSnapshot};
use serde::{Deserialize, Serialize};

use crate::error::PollError;

/// Poll identifier.
pub type PollId = u64;

/// Option identifier, unique within a poll.
pub type OptionId = u64;

/// Participant (user) identifier.
pub type ParticipantId = u64;

/// Opaque room identifier.
pub type RoomId = String;

/// Minimum number of options a poll carries.
pub const MIN_OPTIONS: usize = 2;

/// Maximum number of options a poll carries.
pub const MAX_OPTIONS: usize = 4;

/// One answer option. The vote count is derived from the vote set, never
/// stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    /// Option identifier
    pub id: OptionId,
    /// Display text
    pub text: String,
    /// Whether this is the correct answer
    pub is_correct: bool,
}

impl PollOption {
    /// Create an option.
    #[must_use]
    pub fn new(id: OptionId, text: impl Into<String>, is_correct: bool) -> Self {
        Self { id, text: text.into(), is_correct }
    }
}

/// An accepted vote. At most one exists per (participant, poll) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Voting participant
    pub participant: ParticipantId,
    /// Poll voted on
    pub poll: PollId,
    /// Chosen option
    pub option: OptionId,
    /// Seconds the participant took to answer
    pub time_to_answer_secs: f64,
}

/// Poll lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Created with options but not started
    Pending,
    /// Accepting votes until the deadline
    Active,
    /// Terminal; immutable except for reading final tallies
    Closed,
}

/// Poll state machine.
///
/// This is a pure state machine: time is passed as a parameter to methods
/// that need it. Generic over `Instant` to support virtual time in tests.
///
/// The vote check-then-insert in [`Poll::submit_vote`] is a single
/// synchronous operation; callers that share a poll across tasks must
/// wrap it in one lock so two submissions for the same participant cannot
/// interleave between the check and the insert.
#[derive(Debug, Clone)]
pub struct Poll<I = Instant>
where
    I: Copy + Ord + Sub<Output = Duration> + Add<Duration, Output = I>,
{
    id: PollId,
    room_id: RoomId,
    question: String,
    /// Options in creation order; display order follows this, never the
    /// vote count
    options: Vec<PollOption>,
    duration: Duration,
    state: PollState,
    started_at: Option<I>,
    ends_at: Option<I>,
    /// Accepted votes, keyed by participant (enforces at most one each)
    votes: HashMap<ParticipantId, Vote>,
}

impl<I> Poll<I>
where
    I: Copy + Ord + Sub<Output = Duration> + Add<Duration, Output = I>,
{
    /// Create a poll in the Pending state.
    ///
    /// # Errors
    ///
    /// - [`PollError::InvalidOptionCount`] unless 2-4 options are given
    /// - [`PollError::InvalidCorrectCount`] unless exactly one option is
    ///   marked correct
    /// - [`PollError::InvalidOption`] if two options share an id
    pub fn new(
        id: PollId,
        room_id: impl Into<RoomId>,
        question: impl Into<String>,
        options: Vec<PollOption>,
        duration: Duration,
    ) -> Result<Self, PollError> {
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
            return Err(PollError::InvalidOptionCount(options.len()));
        }

        let correct = options.iter().filter(|o| o.is_correct).count();
        if correct != 1 {
            return Err(PollError::InvalidCorrectCount(correct));
        }

        for (idx, option) in options.iter().enumerate() {
            if options.iter().skip(idx + 1).any(|other| other.id == option.id) {
                return Err(PollError::InvalidOption(option.id));
            }
        }

        Ok(Self {
            id,
            room_id: room_id.into(),
            question: question.into(),
            options,
            duration,
            state: PollState::Pending,
            started_at: None,
            ends_at: None,
            votes: HashMap::new(),
        })
    }

    /// Poll identifier.
    #[must_use]
    pub fn id(&self) -> PollId {
        self.id
    }

    /// Room this poll runs in.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Question text.
    #[must_use]
    pub fn question(&self) -> &str {
        &self.question
    }

    /// Options in creation order.
    #[must_use]
    pub fn options(&self) -> &[PollOption] {
        &self.options
    }

    /// Voting window length.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PollState {
        self.state
    }

    /// When the poll was activated. `None` while Pending.
    #[must_use]
    pub fn started_at(&self) -> Option<I> {
        self.started_at
    }

    /// Wall-clock deadline. `None` while Pending.
    #[must_use]
    pub fn ends_at(&self) -> Option<I> {
        self.ends_at
    }

    /// Number of accepted votes.
    #[must_use]
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Transition Pending → Active, stamping the start time and computing
    /// the deadline as `start + duration`.
    ///
    /// # Errors
    ///
    /// - [`PollError::AlreadyStarted`] if not Pending
    pub fn activate(&mut self, now: I) -> Result<(), PollError> {
        if self.state != PollState::Pending {
            return Err(PollError::AlreadyStarted);
        }

        self.state = PollState::Active;
        self.started_at = Some(now);
        self.ends_at = Some(now + self.duration);

        Ok(())
    }

    /// Transition Active → Closed.
    ///
    /// Returns `true` only for the caller that performed the transition.
    /// Any later call (the losing side of a timer-vs-explicit race, or a
    /// close on a Pending poll) returns `false` and changes nothing.
    pub fn close(&mut self) -> bool {
        if self.state != PollState::Active {
            return false;
        }

        self.state = PollState::Closed;
        true
    }

    /// Validate and record a vote.
    ///
    /// The duplicate check and the insert are one synchronous critical
    /// section from the caller's perspective; see the type-level docs.
    ///
    /// # Errors
    ///
    /// - [`PollError::NotActive`] unless the poll is Active
    /// - [`PollError::DuplicateVote`] if the participant already voted
    /// - [`PollError::InvalidOption`] if the option is not part of this
    ///   poll
    pub fn submit_vote(
        &mut self,
        participant: ParticipantId,
        option: OptionId,
        time_to_answer_secs: f64,
    ) -> Result<Vote, PollError> {
        if self.state != PollState::Active {
            return Err(PollError::NotActive);
        }

        if self.votes.contains_key(&participant) {
            return Err(PollError::DuplicateVote(participant));
        }

        if !self.options.iter().any(|o| o.id == option) {
            return Err(PollError::InvalidOption(option));
        }

        let vote = Vote { participant, poll: self.id, option, time_to_answer_secs };
        self.votes.insert(participant, vote.clone());

        Ok(vote)
    }

    /// Whether the deadline has passed. Always `false` while Pending.
    #[must_use]
    pub fn is_expired(&self, now: I) -> bool {
        self.ends_at.is_some_and(|ends_at| now > ends_at)
    }

    /// Time left in the voting window. Zero unless Active.
    #[must_use]
    pub fn time_remaining(&self, now: I) -> Duration {
        if self.state != PollState::Active {
            return Duration::ZERO;
        }

        match self.ends_at {
            Some(ends_at) if now < ends_at => ends_at - now,
            _ => Duration::ZERO,
        }
    }

    /// Per-option results: vote count, correctness flag, and percentage
    /// of the total vote. Available in any state.
    ///
    /// Percentages are `votes / total * 100` as floats; when no votes
    /// were cast every percentage is 0.0. Option order is creation order.
    #[must_use]
    pub fn results(&self) -> PollResults {
        let total = self.votes.len() as u64;

        let options = self
            .options
            .iter()
            .map(|option| {
                let votes = self.votes.values().filter(|v| v.option == option.id).count() as u64;
                let percentage =
                    if total == 0 { 0.0 } else { votes as f64 / total as f64 * 100.0 };

                OptionResult {
                    option_id: option.id,
                    text: option.text.clone(),
                    is_correct: option.is_correct,
                    votes,
                    percentage,
                }
            })
            .collect();

        PollResults { poll_id: self.id, total_votes: total, options }
    }

    /// Participant-facing description for the `start_poll` broadcast.
    ///
    /// Carries no tallies and no correctness flags; those are only
    /// revealed in the end-of-poll results.
    #[must_use]
    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            poll_id: self.id,
            room_id: self.room_id.clone(),
            question: self.question.clone(),
            options: self
                .options
                .iter()
                .map(|o| PollOptionInfo { option_id: o.id, text: o.text.clone() })
                .collect(),
            duration_secs: self.duration.as_secs(),
        }
    }
}
