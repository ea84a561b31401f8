//! Server error types.
//!
//! One taxonomy for the whole server crate. Validation errors
//! (`Poll(NotActive | DuplicateVote | InvalidOption)`) are translated
//! into client-visible rejections and never crash the engine. Transport
//! and overflow errors are local to one connection and tear down only
//! that connection.

use pollcast_core::PollError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur during server operations.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Room has no registered connections.
    ///
    /// Rooms are reaped when their last connection leaves, so this also
    /// covers rooms that never existed.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Poll is not known to the engine or storage.
    #[error("poll not found: {0}")]
    PollNotFound(u64),

    /// Poll state machine rejected the operation.
    ///
    /// Returned to the submitter as a client-visible rejection; never
    /// fatal to the engine or the room.
    #[error(transparent)]
    Poll(#[from] PollError),

    /// Participant was refused admission to a room.
    #[error("participant {participant} is not a member of room {room}")]
    NotParticipant {
        /// Room that refused admission
        room: String,
        /// Refused participant
        participant: u64,
    },

    /// A connection's outbound queue overflowed and it was dropped.
    #[error("outbound queue full for participant {0}; connection dropped")]
    ConnectionOverflow(u64),

    /// Transport-level read/write failure; the connection is torn down.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame or payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid server configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl From<pollcast_proto::ProtocolError> for ServerError {
    fn from(err: pollcast_proto::ProtocolError) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = ServerError::RoomNotFound("room-1".to_string());
        assert_eq!(err.to_string(), "room not found: room-1");

        let err = ServerError::Poll(PollError::NotActive);
        assert_eq!(err.to_string(), "poll is not active");

        let err = ServerError::ConnectionOverflow(42);
        assert_eq!(
            err.to_string(),
            "outbound queue full for participant 42; connection dropped"
        );
    }
}
