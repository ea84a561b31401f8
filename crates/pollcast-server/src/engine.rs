//! Poll engine: drives the poll state machine and its expiry timer.
//!
//! Wraps each [`Poll`] state machine in its own lock (distinct from the
//! room lock, so votes on one poll never contend with membership changes
//! elsewhere), arms a cancellable one-shot timer per Active poll, and
//! emits lifecycle broadcasts through the [`RoomHub`].
//!
//! # The close race
//!
//! Active → Closed can be triggered by the expiry timer or by an
//! explicit administrative close. Both funnel into [`PollEngine::close`];
//! the state machine's single-transition guard decides the winner, which
//! cancels the timer and issues the one `end_poll` broadcast. The loser
//! observes the Closed state and exits silently.
//!
//! # Persistence boundary
//!
//! Poll snapshots and votes are persisted best-effort around state
//! transitions. A storage failure after the in-memory transition is
//! logged as a warning and never rolled back: the in-memory state is
//! authoritative for real-time behavior, and the broadcast has already
//! been issued.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use pollcast_core::{
    Environment, OptionId, ParticipantId, Poll, PollId, PollState, Vote,
};
use pollcast_proto::{
    FrameHeader, Opcode, Payload,
    payloads::poll::{OptionResult, PollResults, VotePayload},
};
use tokio::task::JoinHandle;

use crate::{
    error::ServerError,
    hub::RoomHub,
    storage::{Storage, StoredOption, StoredPoll, StoredPollState},
};

/// One registered poll: its state machine and its expiry timer handle.
struct PollCell<I>
where
    I: Copy
        + Ord
        + std::ops::Sub<Output = std::time::Duration>
        + std::ops::Add<std::time::Duration, Output = I>,
{
    /// Per-poll lock; every vote check-then-insert and the close
    /// transition run under it
    state: Mutex<Poll<I>>,
    /// Expiry timer, aborted on early close
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Drives poll lifecycles for all rooms of one hub.
///
/// Closed polls stay resident so `compute_results` keeps serving final
/// tallies; a snapshot is also persisted through the storage collaborator
/// on every transition.
pub struct PollEngine<E, S>
where
    E: Environment,
    S: Storage,
{
    hub: Arc<RoomHub>,
    storage: S,
    env: E,
    polls: Mutex<HashMap<PollId, Arc<PollCell<E::Instant>>>>,
    /// Handed to expiry timer tasks so they never keep the engine alive
    self_ref: Weak<Self>,
}

impl<E, S> PollEngine<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Create an engine broadcasting through `hub` and persisting through
    /// `storage`.
    pub fn new(hub: Arc<RoomHub>, storage: S, env: E) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            hub,
            storage,
            env,
            polls: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// The hub this engine broadcasts through.
    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    #[allow(clippy::expect_used)]
    fn cell(&self, poll_id: PollId) -> Result<Arc<PollCell<E::Instant>>, ServerError> {
        self.polls
            .lock()
            .expect("poll map lock poisoned")
            .get(&poll_id)
            .cloned()
            .ok_or(ServerError::PollNotFound(poll_id))
    }

    /// Activate a Pending poll.
    ///
    /// Stamps the start time, computes the deadline, broadcasts the
    /// `start_poll` event (full poll and options, no tallies) to the
    /// owning room, and arms a one-shot expiry timer firing at the
    /// deadline.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Poll`] with [`AlreadyStarted`] if the poll is not
    ///   Pending, or if a poll with the same id is already registered
    ///
    /// [`AlreadyStarted`]: pollcast_core::PollError::AlreadyStarted
    #[allow(clippy::expect_used)]
    pub fn activate(&self, mut poll: Poll<E::Instant>) -> Result<(), ServerError> {
        let now = self.env.now();
        poll.activate(now)?;

        let poll_id = poll.id();
        let room_id = poll.room_id().to_string();
        let duration = poll.duration();
        let snapshot = poll.snapshot();

        let cell = Arc::new(PollCell { state: Mutex::new(poll), timer: Mutex::new(None) });

        {
            let mut polls = self.polls.lock().expect("poll map lock poisoned");
            if polls.contains_key(&poll_id) {
                return Err(ServerError::Poll(pollcast_core::PollError::AlreadyStarted));
            }
            polls.insert(poll_id, Arc::clone(&cell));
        }

        self.persist_snapshot(&cell);

        let mut header = FrameHeader::new(Opcode::StartPoll);
        header.set_poll_id(poll_id);
        let frame = Payload::StartPoll(snapshot).into_frame(header)?;

        if let Err(e) = self.hub.broadcast(&room_id, &frame) {
            tracing::warn!(poll_id, %e, "start_poll broadcast failed");
        }

        tracing::info!(poll_id, %room_id, ?duration, "poll activated");

        // Arm the expiry timer. The handle is kept with the poll so an
        // early explicit close can cancel it; the single-transition guard
        // in close() resolves any cancel-vs-fire race.
        let engine = self.self_ref.clone();
        let env = self.env.clone();
        let handle = tokio::spawn(async move {
            env.sleep(duration).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            match engine.close(poll_id) {
                Ok(Some(_)) => tracing::debug!(poll_id, "poll expired"),
                Ok(None) => tracing::debug!(poll_id, "expiry timer lost the close race"),
                Err(e) => tracing::warn!(poll_id, %e, "expiry close failed"),
            }
        });
        *cell.timer.lock().expect("timer lock poisoned") = Some(handle);

        Ok(())
    }

    /// Close an Active poll.
    ///
    /// Invoked by both the expiry timer and explicit administrative
    /// closes. The first caller to observe the poll Active performs the
    /// transition, cancels the timer, and broadcasts the `end_poll` event
    /// with final tallies; it gets `Ok(Some(results))`. Any other caller
    /// gets `Ok(None)` and nothing happens.
    ///
    /// # Errors
    ///
    /// - [`ServerError::PollNotFound`] if the poll was never activated
    #[allow(clippy::expect_used)]
    pub fn close(&self, poll_id: PollId) -> Result<Option<PollResults>, ServerError> {
        let cell = self.cell(poll_id)?;

        let (results, room_id) = {
            let mut state = cell.state.lock().expect("poll lock poisoned");
            if !state.close() {
                return Ok(None);
            }
            (state.results(), state.room_id().to_string())
        };

        // Cancel the timer. When the timer itself is executing this
        // close, aborting its own handle is inert: there are no await
        // points left in its task.
        if let Some(handle) = cell.timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }

        self.persist_snapshot(&cell);

        let mut header = FrameHeader::new(Opcode::EndPoll);
        header.set_poll_id(poll_id);
        let frame = Payload::EndPoll(results.clone()).into_frame(header)?;

        if let Err(e) = self.hub.broadcast(&room_id, &frame) {
            tracing::warn!(poll_id, %e, "end_poll broadcast failed");
        }

        tracing::info!(poll_id, %room_id, total_votes = results.total_votes, "poll closed");

        Ok(Some(results))
    }

    /// Validate and record a vote, then broadcast the accepted vote to
    /// the room.
    ///
    /// The duplicate check and the insert run inside one critical section
    /// under the per-poll lock, so two concurrent submissions for the
    /// same participant cannot both pass the check.
    ///
    /// # Errors
    ///
    /// - [`ServerError::PollNotFound`] if the poll was never activated
    /// - [`ServerError::Poll`] for `NotActive`, `DuplicateVote`, and
    ///   `InvalidOption` rejections
    #[allow(clippy::expect_used)]
    pub fn submit_vote(
        &self,
        poll_id: PollId,
        participant: ParticipantId,
        option: OptionId,
        time_to_answer_secs: f64,
    ) -> Result<Vote, ServerError> {
        let cell = self.cell(poll_id)?;

        let (vote, room_id) = {
            let mut state = cell.state.lock().expect("poll lock poisoned");
            let vote = state.submit_vote(participant, option, time_to_answer_secs)?;
            (vote, state.room_id().to_string())
        };

        // Best-effort persistence: the vote is already accepted in memory
        // and will be broadcast regardless.
        if let Err(e) = self.storage.save_vote(&vote) {
            tracing::warn!(poll_id, participant, %e, "vote persistence failed");
        }

        let mut header = FrameHeader::new(Opcode::Vote);
        header.set_poll_id(poll_id);
        header.set_sender_id(participant);
        let payload = Payload::Vote(VotePayload {
            poll_id,
            option_id: vote.option,
            time_to_answer_secs: vote.time_to_answer_secs,
            voter_id: Some(participant),
        });
        let frame = payload.into_frame(header)?;

        if let Err(e) = self.hub.broadcast(&room_id, &frame) {
            tracing::warn!(poll_id, %e, "vote broadcast failed");
        }

        Ok(vote)
    }

    /// Per-option results for a poll, in any lifecycle state.
    ///
    /// Resident polls are served from memory; polls known only to the
    /// storage collaborator are served from their persisted snapshot.
    ///
    /// # Errors
    ///
    /// - [`ServerError::PollNotFound`] if neither the engine nor storage
    ///   knows the poll
    #[allow(clippy::expect_used)]
    pub fn compute_results(&self, poll_id: PollId) -> Result<PollResults, ServerError> {
        let resident =
            self.polls.lock().expect("poll map lock poisoned").get(&poll_id).cloned();

        if let Some(cell) = resident {
            return Ok(cell.state.lock().expect("poll lock poisoned").results());
        }

        match self.storage.load_poll(poll_id)? {
            Some(stored) => Ok(results_from_stored(&stored)),
            None => Err(ServerError::PollNotFound(poll_id)),
        }
    }

    /// Lifecycle state of a resident poll. `None` if unknown.
    #[allow(clippy::expect_used)]
    pub fn poll_state(&self, poll_id: PollId) -> Option<PollState> {
        let cell = self.polls.lock().expect("poll map lock poisoned").get(&poll_id).cloned()?;
        let state = cell.state.lock().expect("poll lock poisoned").state();
        Some(state)
    }

    /// Persist the poll's current snapshot; warn-and-continue on failure.
    #[allow(clippy::expect_used)]
    fn persist_snapshot(&self, cell: &PollCell<E::Instant>) {
        let stored = {
            let state = cell.state.lock().expect("poll lock poisoned");
            stored_from_poll(&state)
        };

        if let Err(e) = self.storage.save_poll(&stored) {
            tracing::warn!(poll_id = stored.id, %e, "poll snapshot persistence failed");
        }
    }
}

fn stored_from_poll<I>(poll: &Poll<I>) -> StoredPoll
where
    I: Copy
        + Ord
        + std::ops::Sub<Output = std::time::Duration>
        + std::ops::Add<std::time::Duration, Output = I>,
{
    let results = poll.results();

    StoredPoll {
        id: poll.id(),
        room_id: poll.room_id().to_string(),
        question: poll.question().to_string(),
        options: results
            .options
            .iter()
            .map(|o| StoredOption {
                id: o.option_id,
                text: o.text.clone(),
                is_correct: o.is_correct,
                votes: o.votes,
            })
            .collect(),
        duration_secs: poll.duration().as_secs(),
        state: match poll.state() {
            PollState::Pending => StoredPollState::Pending,
            PollState::Active => StoredPollState::Active,
            PollState::Closed => StoredPollState::Closed,
        },
        total_votes: results.total_votes,
    }
}

fn results_from_stored(stored: &StoredPoll) -> PollResults {
    let total = stored.total_votes;

    PollResults {
        poll_id: stored.id,
        total_votes: total,
        options: stored
            .options
            .iter()
            .map(|o| OptionResult {
                option_id: o.id,
                text: o.text.clone(),
                is_correct: o.is_correct,
                votes: o.votes,
                percentage: if total == 0 {
                    0.0
                } else {
                    o.votes as f64 / total as f64 * 100.0
                },
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pollcast_core::PollOption;

    use super::*;
    use crate::{storage::MemoryStorage, system_env::SystemEnv};

    fn engine() -> (Arc<PollEngine<SystemEnv, MemoryStorage>>, MemoryStorage) {
        let storage = MemoryStorage::new();
        let hub = Arc::new(RoomHub::new());
        (PollEngine::new(hub, storage.clone(), SystemEnv::new()), storage)
    }

    fn pending_poll(id: u64, duration: Duration) -> Poll {
        Poll::new(
            id,
            "room-1",
            "2 + 2?",
            vec![PollOption::new(1, "4", true), PollOption::new(2, "5", false)],
            duration,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn activate_registers_and_times_out() {
        let (engine, _storage) = engine();

        engine.activate(pending_poll(1, Duration::from_millis(50))).unwrap();
        assert_eq!(engine.poll_state(1), Some(PollState::Active));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.poll_state(1), Some(PollState::Closed));
    }

    #[tokio::test]
    async fn explicit_close_beats_timer() {
        let (engine, _storage) = engine();

        engine.activate(pending_poll(1, Duration::from_secs(30))).unwrap();

        let results = engine.close(1).unwrap();
        assert!(results.is_some());
        assert_eq!(engine.poll_state(1), Some(PollState::Closed));

        // The loser of the race is a no-op
        assert!(engine.close(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_poll_id_rejected() {
        let (engine, _storage) = engine();

        engine.activate(pending_poll(1, Duration::from_secs(30))).unwrap();
        let result = engine.activate(pending_poll(1, Duration::from_secs(30)));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn votes_flow_into_results_and_storage() {
        let (engine, storage) = engine();

        engine.activate(pending_poll(1, Duration::from_secs(30))).unwrap();

        engine.submit_vote(1, 10, 1, 0.5).unwrap();
        engine.submit_vote(1, 11, 2, 1.5).unwrap();

        let results = engine.compute_results(1).unwrap();
        assert_eq!(results.total_votes, 2);
        assert_eq!(storage.vote_count(1), 2);
    }

    #[tokio::test]
    async fn unknown_poll_is_not_found() {
        let (engine, _storage) = engine();

        assert!(matches!(
            engine.submit_vote(9, 10, 1, 0.5),
            Err(ServerError::PollNotFound(9))
        ));
        assert!(matches!(engine.close(9), Err(ServerError::PollNotFound(9))));
        assert!(matches!(
            engine.compute_results(9),
            Err(ServerError::PollNotFound(9))
        ));
    }

    #[tokio::test]
    async fn results_fall_back_to_stored_snapshot() {
        let (engine, storage) = engine();

        storage
            .save_poll(&StoredPoll {
                id: 77,
                room_id: "room-1".to_string(),
                question: "q".to_string(),
                options: vec![
                    StoredOption { id: 1, text: "A".to_string(), is_correct: true, votes: 3 },
                    StoredOption { id: 2, text: "B".to_string(), is_correct: false, votes: 1 },
                ],
                duration_secs: 10,
                state: StoredPollState::Closed,
                total_votes: 4,
            })
            .unwrap();

        let results = engine.compute_results(77).unwrap();
        assert_eq!(results.total_votes, 4);
        assert_eq!(results.options[0].percentage, 75.0);
        assert_eq!(results.options[1].percentage, 25.0);
    }
}
