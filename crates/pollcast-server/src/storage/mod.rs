//! Storage collaborator abstraction.
//!
//! Persistent storage of rooms, polls, and votes is an external
//! collaborator of the core: the engine calls these simple synchronous
//! operations around state transitions, but its invariants (vote
//! deduplication, single close) hold even if persistence is slow or
//! failing. A persistence failure after an in-memory transition is
//! logged and NOT rolled back - the in-memory state is authoritative for
//! real-time behavior.

mod faulty;
mod memory;

pub use faulty::FaultyStorage;
pub use memory::MemoryStorage;
use pollcast_core::{ParticipantId, PollId, Vote};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The storage backend failed.
    ///
    /// May be transient (I/O) or permanent (corruption); the engine
    /// treats it as best-effort either way.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Persisted lifecycle state of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredPollState {
    /// Created but not started
    Pending,
    /// Accepting votes
    Active,
    /// Finished
    Closed,
}

/// Persisted snapshot of one poll option, including its tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOption {
    /// Option identifier
    pub id: u64,
    /// Display text
    pub text: String,
    /// Whether this is the correct answer
    pub is_correct: bool,
    /// Accepted votes at snapshot time
    pub votes: u64,
}

/// Persisted snapshot of a poll.
///
/// Written on activation (zero tallies) and again on close (final
/// tallies), so results for a poll that left memory can still be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPoll {
    /// Poll identifier
    pub id: PollId,
    /// Room the poll ran in
    pub room_id: String,
    /// Question text
    pub question: String,
    /// Options in creation order, with tallies
    pub options: Vec<StoredOption>,
    /// Voting window length in seconds
    pub duration_secs: u64,
    /// Lifecycle state at snapshot time
    pub state: StoredPollState,
    /// Total accepted votes at snapshot time
    pub total_votes: u64,
}

/// Storage abstraction for room membership, polls, and votes.
///
/// Must be Clone (shared across the engine and every connection task),
/// Send + Sync, and synchronous. Implementations typically share state
/// via `Arc`, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Whether a participant belongs to a room.
    ///
    /// Consulted before admitting a connection into a room.
    fn is_participant(&self, room_id: &str, participant: ParticipantId)
    -> Result<bool, StorageError>;

    /// Load a persisted poll snapshot. `None` if never persisted.
    fn load_poll(&self, poll_id: PollId) -> Result<Option<StoredPoll>, StorageError>;

    /// Persist a poll snapshot, overwriting any previous one.
    fn save_poll(&self, poll: &StoredPoll) -> Result<(), StorageError>;

    /// Persist an accepted vote.
    fn save_vote(&self, vote: &Vote) -> Result<(), StorageError>;
}
