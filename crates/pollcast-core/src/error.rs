//! Error types for the pollcast core.
//!
//! Strongly-typed errors for the two state machines. Poll validation
//! errors are returned to the vote submitter and never crash the engine;
//! session errors are local to one connection.

use thiserror::Error;

use crate::session::SessionState;

/// Errors from poll state machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// Operation requires the poll to be in the Active state
    #[error("poll is not active")]
    NotActive,

    /// Participant already has an accepted vote for this poll
    #[error("participant {0} has already voted")]
    DuplicateVote(u64),

    /// Option does not belong to this poll
    #[error("option {0} does not belong to this poll")]
    InvalidOption(u64),

    /// Poll has already left the Pending state
    #[error("poll has already been started")]
    AlreadyStarted,

    /// Polls carry between 2 and 4 options
    #[error("poll requires 2-4 options, got {0}")]
    InvalidOptionCount(usize),

    /// Exactly one option must be marked correct
    #[error("poll requires exactly one correct option, got {0}")]
    InvalidCorrectCount(usize),
}

/// Errors from session state machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Received unexpected frame for the current state
    #[error("unexpected frame: opcode {opcode:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state when the frame was received
        state: SessionState,
        /// Opcode of the unexpected frame
        opcode: u16,
    },

    /// Unsupported protocol version in a Hello frame
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload did not match the frame's opcode
    #[error("invalid payload: expected {expected} for opcode {opcode:#06x}")]
    InvalidPayload {
        /// Expected payload type
        expected: &'static str,
        /// Opcode that was received
        opcode: u16,
    },

    /// Frame parsing or encoding failed
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<pollcast_proto::ProtocolError> for SessionError {
    fn from(err: pollcast_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
