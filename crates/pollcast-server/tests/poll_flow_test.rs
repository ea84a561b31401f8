//! End-to-end poll lifecycle tests over hub, engine, and router.
//!
//! Connections are modeled as bounded channels registered with the hub,
//! exactly as the connection pumps register them in production; frames
//! are decoded from the raw bytes each "client" receives.
//!
//! # Oracle Pattern
//!
//! Each test ends with oracle checks on the frames every client observed
//! and on the engine's result tallies.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use pollcast_core::{Poll, PollError, PollOption, PollState};
use pollcast_proto::{ErrorPayload, Frame, Opcode, Payload};
use pollcast_server::{
    InboundContext, MessageRouter, PollEngine, RoomHub, ServerError, SystemEnv,
    storage::{FaultyStorage, MemoryStorage, Storage},
};
use tokio::sync::mpsc;

const ROOM: &str = "room-1";

fn engine_with<S: Storage>(storage: S) -> (Arc<PollEngine<SystemEnv, S>>, Arc<RoomHub>) {
    let hub = Arc::new(RoomHub::new());
    let engine = PollEngine::new(Arc::clone(&hub), storage, SystemEnv::new());
    (engine, hub)
}

fn two_option_poll(id: u64, duration: Duration) -> Poll {
    Poll::new(
        id,
        ROOM,
        "2 + 2?",
        vec![PollOption::new(1, "A", true), PollOption::new(2, "B", false)],
        duration,
    )
    .unwrap()
}

fn connect(hub: &RoomHub, participant: u64) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(16);
    hub.join(ROOM, participant, tx.clone());
    (tx, rx)
}

async fn recv_frame(rx: &mut mpsc::Receiver<Bytes>) -> Frame {
    let bytes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed");
    Frame::decode(&bytes).unwrap()
}

#[tokio::test]
async fn three_connections_full_poll_lifecycle() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let router = MessageRouter::new(Arc::clone(&engine), Arc::clone(&hub));

    let (tx1, mut rx1) = connect(&hub, 1);
    let (tx2, mut rx2) = connect(&hub, 2);
    let (_tx3, mut rx3) = connect(&hub, 3);

    engine.activate(two_option_poll(1, Duration::from_secs(1))).unwrap();

    // All three receive start_poll with the full option list and no
    // correctness information
    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        let frame = recv_frame(rx).await;
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::StartPoll));
        match Payload::from_frame(&frame).unwrap() {
            Payload::StartPoll(snapshot) => {
                assert_eq!(snapshot.poll_id, 1);
                assert_eq!(snapshot.options.len(), 2);
            },
            other => panic!("expected start_poll, got {other:?}"),
        }
    }

    // Two participants vote through the router within the window
    let vote = |poll_id: u64, option_id: u64| {
        Payload::Vote(pollcast_proto::payloads::poll::VotePayload {
            poll_id,
            option_id,
            time_to_answer_secs: 0.8,
            voter_id: None,
        })
        .into_frame(pollcast_proto::FrameHeader::new(Opcode::Vote))
        .unwrap()
    };

    router.route(&InboundContext { room_id: ROOM, participant: 1, outbound: &tx1 }, &vote(1, 1));
    router.route(&InboundContext { room_id: ROOM, participant: 2, outbound: &tx2 }, &vote(1, 2));

    // Everyone sees both vote broadcasts; the third participant stays
    // silent but still observes them
    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        for _ in 0..2 {
            let frame = recv_frame(rx).await;
            assert_eq!(frame.header.opcode_enum(), Some(Opcode::Vote));
        }
    }

    // At the deadline the timer broadcasts end_poll with final tallies
    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        let frame = recv_frame(rx).await;
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::EndPoll));
        match Payload::from_frame(&frame).unwrap() {
            Payload::EndPoll(results) => {
                assert_eq!(results.total_votes, 2);
                assert_eq!(results.options[0].votes, 1);
                assert_eq!(results.options[0].percentage, 50.0);
                assert_eq!(results.options[1].votes, 1);
                assert_eq!(results.options[1].percentage, 50.0);
            },
            other => panic!("expected end_poll, got {other:?}"),
        }
    }

    assert_eq!(engine.poll_state(1), Some(PollState::Closed));
}

#[tokio::test]
async fn duplicate_vote_is_rejected_and_tally_unchanged() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let (_tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    engine.submit_vote(1, 42, 1, 0.5).unwrap();
    let _ = recv_frame(&mut rx).await; // vote broadcast

    // Resubmitting a different option fails and changes nothing
    let result = engine.submit_vote(1, 42, 2, 1.0);
    assert!(matches!(result, Err(ServerError::Poll(PollError::DuplicateVote(42)))));

    let results = engine.compute_results(1).unwrap();
    assert_eq!(results.total_votes, 1);
    assert_eq!(results.options[0].votes, 1);
    assert_eq!(results.options[1].votes, 0);
}

#[tokio::test]
async fn rejected_vote_reply_goes_to_submitter_via_router() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let router = MessageRouter::new(Arc::clone(&engine), Arc::clone(&hub));
    let (tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    let bad_vote = Payload::Vote(pollcast_proto::payloads::poll::VotePayload {
        poll_id: 1,
        option_id: 99,
        time_to_answer_secs: 0.5,
        voter_id: None,
    })
    .into_frame(pollcast_proto::FrameHeader::new(Opcode::Vote))
    .unwrap();

    router.route(&InboundContext { room_id: ROOM, participant: 42, outbound: &tx }, &bad_vote);

    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::Error));
    match Payload::from_frame(&frame).unwrap() {
        Payload::Error(payload) => assert_eq!(payload.code, ErrorPayload::INVALID_OPTION),
        other => panic!("expected error payload, got {other:?}"),
    }
}

#[tokio::test]
async fn no_vote_is_accepted_after_close() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let (_tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    engine.submit_vote(1, 10, 1, 0.5).unwrap();
    let _ = recv_frame(&mut rx).await; // vote broadcast

    engine.close(1).unwrap();
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::EndPoll));

    // After the end broadcast no submission is ever accepted
    let result = engine.submit_vote(1, 11, 2, 0.5);
    assert!(matches!(result, Err(ServerError::Poll(PollError::NotActive))));

    let results = engine.compute_results(1).unwrap();
    assert_eq!(results.total_votes, 1);

    // And no further frame reaches the room
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_closes_produce_exactly_one_end_broadcast() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let (_tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_millis(100))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    // Explicit close races the expiry timer
    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.close(1).unwrap() })
    };
    let second = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.close(1).unwrap() })
    };

    let outcomes = [first.await.unwrap(), second.await.unwrap()];
    let winners = outcomes.iter().filter(|o| o.is_some()).count();
    assert!(winners <= 1, "at most one explicit close may win against the timer");

    // Give the timer time to fire (and lose) as well
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut end_broadcasts = 0;
    while let Ok(bytes) = rx.try_recv() {
        let frame = Frame::decode(&bytes).unwrap();
        if frame.header.opcode_enum() == Some(Opcode::EndPoll) {
            end_broadcasts += 1;
        }
    }
    assert_eq!(end_broadcasts, 1, "exactly one end_poll broadcast");
    assert_eq!(engine.poll_state(1), Some(PollState::Closed));
}

#[tokio::test]
async fn expiry_timer_closes_without_explicit_action() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let (_tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_millis(50))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::EndPoll));
    assert_eq!(engine.poll_state(1), Some(PollState::Closed));
}

#[tokio::test]
async fn early_close_cancels_timer() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let (_tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_millis(100))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    assert!(engine.close(1).unwrap().is_some());
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::EndPoll));

    // Past the original deadline the cancelled timer must not produce a
    // second end broadcast
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn member_who_left_never_receives_later_broadcasts() {
    let (engine, hub) = engine_with(MemoryStorage::new());
    let (_tx1, mut rx1) = connect(&hub, 1);
    let (_tx2, mut rx2) = connect(&hub, 2);

    hub.leave(ROOM, 1);

    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();

    let frame = recv_frame(&mut rx2).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::StartPoll));
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn stalled_connection_is_dropped_and_room_keeps_working() {
    let (engine, hub) = engine_with(MemoryStorage::new());

    // A stalled consumer: queue capacity of one, never drained
    let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
    hub.join(ROOM, 1, stalled_tx);
    let (_tx2, mut rx2) = connect(&hub, 2);

    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();
    let _ = recv_frame(&mut rx2).await; // start_poll

    // The stalled queue is now full; the next broadcast evicts it
    engine.submit_vote(1, 2, 1, 0.5).unwrap();
    let _ = recv_frame(&mut rx2).await; // vote broadcast

    assert_eq!(hub.members(ROOM), vec![2]);

    // Subsequent broadcasts succeed for the remaining connection
    engine.close(1).unwrap();
    let frame = recv_frame(&mut rx2).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::EndPoll));

    // The evicted connection only ever got the first message
    assert!(stalled_rx.try_recv().is_ok());
    assert!(stalled_rx.try_recv().is_err());
}

#[tokio::test]
async fn persistence_failure_does_not_roll_back_accepted_votes() {
    let storage = FaultyStorage::new(MemoryStorage::new());
    let (engine, hub) = engine_with(storage.clone());
    let (_tx, mut rx) = connect(&hub, 42);

    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();
    let _ = recv_frame(&mut rx).await; // start_poll

    storage.fail_votes(true);

    // The vote is accepted and broadcast even though persistence failed
    engine.submit_vote(1, 42, 1, 0.5).unwrap();
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::Vote));

    assert_eq!(storage.inner().vote_count(1), 0);

    let results = engine.compute_results(1).unwrap();
    assert_eq!(results.total_votes, 1);
}

#[tokio::test]
async fn poll_snapshot_persistence_failure_is_survivable() {
    let storage = FaultyStorage::new(MemoryStorage::new());
    let (engine, hub) = engine_with(storage.clone());
    let (_tx, mut rx) = connect(&hub, 42);

    storage.fail_polls(true);

    // Activation and close both broadcast despite failing persistence
    engine.activate(two_option_poll(1, Duration::from_secs(30))).unwrap();
    assert_eq!(recv_frame(&mut rx).await.header.opcode_enum(), Some(Opcode::StartPoll));

    engine.close(1).unwrap();
    assert_eq!(recv_frame(&mut rx).await.header.opcode_enum(), Some(Opcode::EndPoll));

    assert!(storage.inner().load_poll(1).unwrap().is_none());
}
