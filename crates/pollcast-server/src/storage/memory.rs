use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use pollcast_core::{ParticipantId, PollId, Vote};

use super::{Storage, StorageError, StoredPoll};

/// In-memory storage implementation.
///
/// Rooms and their participant sets are seeded through
/// [`MemoryStorage::create_room`] and [`MemoryStorage::add_participant`]
/// by whatever admission flow sits in front of the server (the HTTP API
/// in a full deployment, test setup in tests). All state is wrapped in
/// `Arc<Mutex<>>` so clones share the same underlying storage.
///
/// Uses `lock().expect()` which panics if the mutex is poisoned (a
/// thread panicked while holding the lock) - acceptable for an
/// in-process backend.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Room ID → participant set
    rooms: HashMap<String, HashSet<ParticipantId>>,

    /// Poll snapshots by poll ID
    polls: HashMap<PollId, StoredPoll>,

    /// Accepted votes per poll, in acceptance order
    votes: HashMap<PollId, Vec<Vote>>,

    /// Admit any participant into any room (development mode)
    open_admission: bool,
}

impl MemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::with_admission(false)
    }

    /// Create a storage that admits any participant into any room.
    ///
    /// Development convenience only; skips the membership authority
    /// entirely.
    pub fn open_admission() -> Self {
        Self::with_admission(true)
    }

    fn with_admission(open_admission: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                rooms: HashMap::new(),
                polls: HashMap::new(),
                votes: HashMap::new(),
                open_admission,
            })),
        }
    }

    /// Register a room. Idempotent.
    #[allow(clippy::expect_used)]
    pub fn create_room(&self, room_id: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.rooms.entry(room_id.to_string()).or_default();
    }

    /// Add a participant to a room, creating the room if needed.
    #[allow(clippy::expect_used)]
    pub fn add_participant(&self, room_id: &str, participant: ParticipantId) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.rooms.entry(room_id.to_string()).or_default().insert(participant);
    }

    /// Number of votes persisted for a poll. Useful in tests.
    #[allow(clippy::expect_used)]
    pub fn vote_count(&self, poll_id: PollId) -> usize {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner.votes.get(&poll_id).map_or(0, Vec::len)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn is_participant(
        &self,
        room_id: &str,
        participant: ParticipantId,
    ) -> Result<bool, StorageError> {
        let inner = self.inner.lock().expect("mutex poisoned");

        if inner.open_admission {
            return Ok(true);
        }

        Ok(inner.rooms.get(room_id).is_some_and(|members| members.contains(&participant)))
    }

    #[allow(clippy::expect_used)]
    fn load_poll(&self, poll_id: PollId) -> Result<Option<StoredPoll>, StorageError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.polls.get(&poll_id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn save_poll(&self, poll: &StoredPoll) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.polls.insert(poll.id, poll.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn save_vote(&self, vote: &Vote) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.votes.entry(vote.poll).or_default().push(vote.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_checks() {
        let storage = MemoryStorage::new();
        storage.create_room("room-1");
        storage.add_participant("room-1", 42);

        assert!(storage.is_participant("room-1", 42).unwrap());
        assert!(!storage.is_participant("room-1", 43).unwrap());
        assert!(!storage.is_participant("room-2", 42).unwrap());
    }

    #[test]
    fn open_admission_admits_everyone() {
        let storage = MemoryStorage::open_admission();

        assert!(storage.is_participant("never-created", 999).unwrap());
    }

    #[test]
    fn poll_snapshots_overwrite() {
        use super::super::{StoredOption, StoredPollState};

        let storage = MemoryStorage::new();
        let mut poll = StoredPoll {
            id: 1,
            room_id: "room-1".to_string(),
            question: "q".to_string(),
            options: vec![StoredOption {
                id: 1,
                text: "A".to_string(),
                is_correct: true,
                votes: 0,
            }],
            duration_secs: 5,
            state: StoredPollState::Active,
            total_votes: 0,
        };

        storage.save_poll(&poll).unwrap();
        poll.state = StoredPollState::Closed;
        poll.total_votes = 3;
        storage.save_poll(&poll).unwrap();

        let loaded = storage.load_poll(1).unwrap().unwrap();
        assert_eq!(loaded.state, StoredPollState::Closed);
        assert_eq!(loaded.total_votes, 3);

        assert!(storage.load_poll(2).unwrap().is_none());
    }

    #[test]
    fn votes_accumulate() {
        let storage = MemoryStorage::new();

        for participant in 1..=3 {
            storage
                .save_vote(&Vote {
                    participant,
                    poll: 7,
                    option: 1,
                    time_to_answer_secs: 0.5,
                })
                .unwrap();
        }

        assert_eq!(storage.vote_count(7), 3);
        assert_eq!(storage.vote_count(8), 0);
    }

    #[test]
    fn clones_share_state() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();

        storage.add_participant("room-1", 42);
        assert!(clone.is_participant("room-1", 42).unwrap());
    }
}
