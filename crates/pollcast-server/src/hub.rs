//! Room hub: per-room connection registry and broadcast fan-out.
//!
//! The hub owns the live membership of every room: participant id →
//! outbound queue sender. It is an explicit object (no process-wide
//! singleton), so tests can run multiple independent hubs.
//!
//! # Concurrency discipline
//!
//! A single `RwLock` guards the room map: readers are the broadcast
//! fan-out iteration, writers are join/leave/evict. The lock is never
//! held across an await point - enqueueing uses the non-blocking
//! `try_send`, and frames are encoded before the lock is taken.
//!
//! # Back-pressure policy
//!
//! Producers never block on a full outbound queue. A connection whose
//! queue is full (a slow or stalled consumer) is evicted: its entry is
//! removed and its sender dropped, which terminates the connection's
//! outbound pump and closes the transport. A broadcast therefore reaches
//! every connection registered at call time, or removes it - a
//! connection is never silently skipped while left registered.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use bytes::{Bytes, BytesMut};
use pollcast_core::{ParticipantId, RoomId};
use pollcast_proto::{Frame, FrameHeader};
use tokio::sync::mpsc;

use crate::error::ServerError;

/// Registry of live connections grouped by room.
///
/// Rooms are created on first join and reaped when the last connection
/// leaves.
#[derive(Debug, Default)]
pub struct RoomHub {
    /// Room ID → (participant ID → outbound queue sender)
    rooms: RwLock<HashMap<RoomId, HashMap<ParticipantId, mpsc::Sender<Bytes>>>>,
}

impl RoomHub {
    /// Create a new empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a room, creating the room entry if
    /// absent.
    ///
    /// Idempotent per participant: a re-join (reconnect) replaces the
    /// prior entry, and dropping the replaced sender shuts the old
    /// connection's outbound pump down. Returns `true` if an entry was
    /// replaced.
    #[allow(clippy::expect_used)]
    pub fn join(
        &self,
        room_id: &str,
        participant: ParticipantId,
        sender: mpsc::Sender<Bytes>,
    ) -> bool {
        let mut rooms = self.rooms.write().expect("room lock poisoned");
        let replaced = rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(participant, sender)
            .is_some();

        if replaced {
            tracing::debug!(room_id, participant, "connection replaced on re-join");
        }

        replaced
    }

    /// Remove a connection from a room. No-op if absent.
    ///
    /// The room entry is removed when it becomes empty.
    #[allow(clippy::expect_used)]
    pub fn leave(&self, room_id: &str, participant: ParticipantId) -> bool {
        let mut rooms = self.rooms.write().expect("room lock poisoned");
        Self::remove_entry(&mut rooms, room_id, participant, None)
    }

    /// Remove a connection only if `sender` is still the registered one.
    ///
    /// Used by connection pump cleanup: after a re-join replaced the
    /// entry, the stale pump's cleanup must not remove its replacement.
    #[allow(clippy::expect_used)]
    pub fn leave_if_same(
        &self,
        room_id: &str,
        participant: ParticipantId,
        sender: &mpsc::Sender<Bytes>,
    ) -> bool {
        let mut rooms = self.rooms.write().expect("room lock poisoned");
        Self::remove_entry(&mut rooms, room_id, participant, Some(sender))
    }

    fn remove_entry(
        rooms: &mut HashMap<RoomId, HashMap<ParticipantId, mpsc::Sender<Bytes>>>,
        room_id: &str,
        participant: ParticipantId,
        expected: Option<&mpsc::Sender<Bytes>>,
    ) -> bool {
        let Some(members) = rooms.get_mut(room_id) else {
            return false;
        };

        let matches = members.get(&participant).is_some_and(|current| {
            expected.is_none_or(|expected| current.same_channel(expected))
        });

        if matches {
            members.remove(&participant);
        }

        if members.is_empty() {
            rooms.remove(room_id);
        }

        matches
    }

    /// Broadcast a frame to every connection registered in a room.
    ///
    /// The frame is serialized once; the bytes are then enqueued on each
    /// connection's outbound queue without blocking. Connections whose
    /// queue is full or already closed are evicted from the room.
    ///
    /// Returns the number of connections the frame was delivered to.
    ///
    /// # Errors
    ///
    /// - [`ServerError::RoomNotFound`] if the room has no registered
    ///   connections
    /// - [`ServerError::Serialization`] if the frame cannot be encoded
    #[allow(clippy::expect_used)]
    pub fn broadcast(&self, room_id: &str, frame: &Frame) -> Result<usize, ServerError> {
        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + frame.payload.len());
        frame.encode(&mut buf)?;
        let bytes = buf.freeze();

        let mut delivered = 0usize;
        let mut evicted: Vec<(ParticipantId, mpsc::Sender<Bytes>)> = Vec::new();

        {
            let rooms = self.rooms.read().expect("room lock poisoned");
            let Some(members) = rooms.get(room_id) else {
                return Err(ServerError::RoomNotFound(room_id.to_string()));
            };

            for (&participant, sender) in members {
                match sender.try_send(bytes.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_))
                    | Err(mpsc::error::TrySendError::Closed(_)) => {
                        evicted.push((participant, sender.clone()));
                    },
                }
            }
        }

        if !evicted.is_empty() {
            let mut rooms = self.rooms.write().expect("room lock poisoned");
            for (participant, stale) in evicted {
                tracing::warn!(
                    room_id,
                    participant,
                    "outbound queue full; dropping connection"
                );
                // Membership may have changed between the read and write
                // lock: only evict the exact sender that overflowed.
                Self::remove_entry(&mut rooms, room_id, participant, Some(&stale));
            }
        }

        Ok(delivered)
    }

    /// Whether a room currently has registered connections.
    #[allow(clippy::expect_used)]
    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().expect("room lock poisoned").contains_key(room_id)
    }

    /// Participants currently registered in a room. Order is arbitrary.
    #[allow(clippy::expect_used)]
    pub fn members(&self, room_id: &str) -> Vec<ParticipantId> {
        self.rooms
            .read()
            .expect("room lock poisoned")
            .get(room_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections registered in a room.
    #[allow(clippy::expect_used)]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.read().expect("room lock poisoned").get(room_id).map_or(0, HashMap::len)
    }

    /// Number of rooms with at least one connection.
    #[allow(clippy::expect_used)]
    pub fn room_count(&self) -> usize {
        self.rooms.read().expect("room lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use pollcast_proto::Opcode;

    use super::*;

    fn frame() -> Frame {
        Frame::new(FrameHeader::new(Opcode::Ping), Vec::new())
    }

    fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(capacity)
    }

    #[test]
    fn join_creates_room_and_leave_reaps_it() {
        let hub = RoomHub::new();
        let (tx, _rx) = channel(4);

        assert!(!hub.has_room("room-1"));

        hub.join("room-1", 1, tx);
        assert!(hub.has_room("room-1"));
        assert_eq!(hub.member_count("room-1"), 1);

        assert!(hub.leave("room-1", 1));
        assert!(!hub.has_room("room-1"));
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn leave_absent_is_noop() {
        let hub = RoomHub::new();
        assert!(!hub.leave("room-1", 1));

        let (tx, _rx) = channel(4);
        hub.join("room-1", 1, tx);
        assert!(!hub.leave("room-1", 2));
        assert_eq!(hub.member_count("room-1"), 1);
    }

    #[test]
    fn rejoin_replaces_prior_entry() {
        let hub = RoomHub::new();
        let (old_tx, mut old_rx) = channel(4);
        let (new_tx, mut new_rx) = channel(4);

        assert!(!hub.join("room-1", 1, old_tx));
        assert!(hub.join("room-1", 1, new_tx));
        assert_eq!(hub.member_count("room-1"), 1);

        // The replaced sender was dropped, so its channel is closed
        assert!(old_rx.try_recv().is_err());

        hub.broadcast("room-1", &frame()).unwrap();
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn stale_pump_cannot_remove_replacement() {
        let hub = RoomHub::new();
        let (old_tx, _old_rx) = channel(4);
        let stale = old_tx.clone();

        hub.join("room-1", 1, old_tx);

        let (new_tx, _new_rx) = channel(4);
        hub.join("room-1", 1, new_tx.clone());

        // The stale pump's cleanup must be a no-op
        assert!(!hub.leave_if_same("room-1", 1, &stale));
        assert_eq!(hub.member_count("room-1"), 1);

        // The current pump's cleanup still works
        assert!(hub.leave_if_same("room-1", 1, &new_tx));
        assert!(!hub.has_room("room-1"));
    }

    #[test]
    fn broadcast_reaches_all_members() {
        let hub = RoomHub::new();
        let (tx1, mut rx1) = channel(4);
        let (tx2, mut rx2) = channel(4);

        hub.join("room-1", 1, tx1);
        hub.join("room-1", 2, tx2);

        let delivered = hub.broadcast("room-1", &frame()).unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn broadcast_to_missing_room_fails() {
        let hub = RoomHub::new();
        let result = hub.broadcast("room-1", &frame());
        assert!(matches!(result, Err(ServerError::RoomNotFound(_))));
    }

    #[test]
    fn member_who_left_receives_nothing() {
        let hub = RoomHub::new();
        let (tx1, mut rx1) = channel(4);
        let (tx2, mut rx2) = channel(4);

        hub.join("room-1", 1, tx1);
        hub.join("room-1", 2, tx2);
        hub.leave("room-1", 1);

        hub.broadcast("room-1", &frame()).unwrap();
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn full_queue_evicts_connection() {
        let hub = RoomHub::new();
        let (stalled_tx, mut stalled_rx) = channel(1);
        let (healthy_tx, mut healthy_rx) = channel(4);

        hub.join("room-1", 1, stalled_tx);
        hub.join("room-1", 2, healthy_tx);

        // First broadcast fills the stalled connection's queue
        assert_eq!(hub.broadcast("room-1", &frame()).unwrap(), 2);

        // Second broadcast overflows it: evicted, others unaffected
        assert_eq!(hub.broadcast("room-1", &frame()).unwrap(), 1);
        assert_eq!(hub.members("room-1"), vec![2]);

        // Subsequent broadcasts succeed for the remaining connection
        assert_eq!(hub.broadcast("room-1", &frame()).unwrap(), 1);
        assert!(healthy_rx.try_recv().is_ok());

        // The evicted connection's sender was dropped; it only ever got
        // the first message
        assert!(stalled_rx.try_recv().is_ok());
        assert!(stalled_rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_is_evicted() {
        let hub = RoomHub::new();
        let (tx1, rx1) = channel(4);
        let (tx2, mut rx2) = channel(4);

        hub.join("room-1", 1, tx1);
        hub.join("room-1", 2, tx2);

        drop(rx1);

        assert_eq!(hub.broadcast("room-1", &frame()).unwrap(), 1);
        assert_eq!(hub.members("room-1"), vec![2]);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn rooms_are_isolated() {
        let hub = RoomHub::new();
        let (tx1, mut rx1) = channel(4);
        let (tx2, mut rx2) = channel(4);

        hub.join("room-1", 1, tx1);
        hub.join("room-2", 2, tx2);

        hub.broadcast("room-1", &frame()).unwrap();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
