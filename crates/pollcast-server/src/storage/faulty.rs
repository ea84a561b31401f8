use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use pollcast_core::{ParticipantId, PollId, Vote};

use super::{Storage, StorageError, StoredPoll};

/// Storage wrapper with switchable failure injection.
///
/// Wraps another storage and fails selected write operations on demand.
/// Used to verify the eventual-consistency boundary: an in-memory
/// transition that already broadcast must survive a persistence failure
/// unchanged.
#[derive(Clone)]
pub struct FaultyStorage<S> {
    inner: S,
    fail_polls: Arc<AtomicBool>,
    fail_votes: Arc<AtomicBool>,
}

impl<S: Storage> FaultyStorage<S> {
    /// Wrap a storage with failure injection disabled.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_polls: Arc::new(AtomicBool::new(false)),
            fail_votes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every `save_poll` fail until switched back.
    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Make every `save_vote` fail until switched back.
    pub fn fail_votes(&self, fail: bool) {
        self.fail_votes.store(fail, Ordering::SeqCst);
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Storage> Storage for FaultyStorage<S> {
    fn is_participant(
        &self,
        room_id: &str,
        participant: ParticipantId,
    ) -> Result<bool, StorageError> {
        self.inner.is_participant(room_id, participant)
    }

    fn load_poll(&self, poll_id: PollId) -> Result<Option<StoredPoll>, StorageError> {
        self.inner.load_poll(poll_id)
    }

    fn save_poll(&self, poll: &StoredPoll) -> Result<(), StorageError> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected save_poll failure".to_string()));
        }
        self.inner.save_poll(poll)
    }

    fn save_vote(&self, vote: &Vote) -> Result<(), StorageError> {
        if self.fail_votes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected save_vote failure".to_string()));
        }
        self.inner.save_vote(vote)
    }
}

#[cfg(test)]
mod tests {
    use super::{super::MemoryStorage, *};

    #[test]
    fn passes_through_when_healthy() {
        let storage = FaultyStorage::new(MemoryStorage::new());
        storage.inner().add_participant("room-1", 42);

        assert!(storage.is_participant("room-1", 42).unwrap());

        storage
            .save_vote(&Vote { participant: 42, poll: 1, option: 1, time_to_answer_secs: 0.5 })
            .unwrap();
        assert_eq!(storage.inner().vote_count(1), 1);
    }

    #[test]
    fn injected_failures_and_recovery() {
        let storage = FaultyStorage::new(MemoryStorage::new());
        let vote = Vote { participant: 42, poll: 1, option: 1, time_to_answer_secs: 0.5 };

        storage.fail_votes(true);
        assert!(storage.save_vote(&vote).is_err());
        assert_eq!(storage.inner().vote_count(1), 0);

        storage.fail_votes(false);
        assert!(storage.save_vote(&vote).is_ok());
        assert_eq!(storage.inner().vote_count(1), 1);
    }
}
