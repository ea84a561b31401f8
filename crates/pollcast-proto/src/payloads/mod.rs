//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary for cheap routing, but payloads use CBOR
//! for type safety and forward compatibility. The `Payload` enum covers
//! all message types: session management (Hello, Ping, ...) and poll
//! lifecycle events (StartPoll, Vote, EndPoll).
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Round-trip encoding must produce equivalent values.

pub mod poll;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads.
///
/// The payload type is determined by the `Opcode` in the frame header, so
/// only the inner struct content is serialized - no variant tag in CBOR.
/// This prevents mismatched opcode/payload pairs on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    // Session management
    /// Initial handshake
    Hello(session::Hello),
    /// Server response to Hello
    HelloReply(session::HelloReply),
    /// Graceful disconnect
    Goodbye(session::Goodbye),
    /// Ping for keepalive
    Ping,
    /// Pong response
    Pong,

    // Poll lifecycle
    /// Poll activated
    StartPoll(poll::PollSnapshot),
    /// Vote submission or accepted-vote broadcast
    Vote(poll::VotePayload),
    /// Poll closed with final results
    EndPoll(poll::PollResults),

    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorPayload {
    /// Operation requires an active poll.
    pub const NOT_ACTIVE: u16 = 0x0001;
    /// Participant already has an accepted vote for this poll.
    pub const DUPLICATE_VOTE: u16 = 0x0002;
    /// Option does not belong to the poll.
    pub const INVALID_OPTION: u16 = 0x0003;
    /// Room does not exist.
    pub const ROOM_NOT_FOUND: u16 = 0x0004;
    /// Poll does not exist.
    pub const POLL_NOT_FOUND: u16 = 0x0005;
    /// Participant is not a member of the room.
    pub const NOT_PARTICIPANT: u16 = 0x0006;
    /// Payload could not be decoded.
    pub const INVALID_PAYLOAD: u16 = 0x0007;
    /// Frame was rejected for another reason.
    pub const REJECTED: u16 = 0x00FF;

    /// Poll is not accepting votes.
    pub fn not_active(poll_id: u64) -> Self {
        Self { code: Self::NOT_ACTIVE, message: format!("poll {poll_id} is not active") }
    }

    /// Participant already voted on this poll.
    pub fn duplicate_vote(poll_id: u64) -> Self {
        Self { code: Self::DUPLICATE_VOTE, message: format!("already voted on poll {poll_id}") }
    }

    /// Option does not belong to the poll.
    pub fn invalid_option(option_id: u64) -> Self {
        Self {
            code: Self::INVALID_OPTION,
            message: format!("option {option_id} does not belong to this poll"),
        }
    }

    /// Room lookup failed.
    pub fn room_not_found(room_id: &str) -> Self {
        Self { code: Self::ROOM_NOT_FOUND, message: format!("room not found: {room_id}") }
    }

    /// Poll lookup failed.
    pub fn poll_not_found(poll_id: u64) -> Self {
        Self { code: Self::POLL_NOT_FOUND, message: format!("poll not found: {poll_id}") }
    }

    /// Participant was refused admission to the room.
    pub fn not_participant(room_id: &str) -> Self {
        Self {
            code: Self::NOT_PARTICIPANT,
            message: format!("not a participant of room {room_id}"),
        }
    }

    /// Payload decoding failed.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self { code: Self::INVALID_PAYLOAD, message: msg.into() }
    }

    /// Generic rejection.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self { code: Self::REJECTED, message: msg.into() }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::StartPoll(_) => Opcode::StartPoll,
            Self::Vote(_) => Opcode::Vote,
            Self::EndPoll(_) => Opcode::EndPoll,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode the payload to a buffer.
    ///
    /// Serializes only the inner struct, not the variant tag; the frame
    /// header's opcode already identifies the payload type.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CborEncode`] if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ping | Self::Pong => Ok(()), // Zero-byte payloads
            Self::StartPoll(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Vote(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::EndPoll(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode a payload from bytes based on the opcode.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLarge`] if bytes exceed the limit
    /// - [`ProtocolError::CborDecode`] if deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            Opcode::HelloReply => Self::HelloReply(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            Opcode::Goodbye => Self::Goodbye(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::StartPoll => Self::StartPoll(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            Opcode::Vote => Self::Vote(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            Opcode::EndPoll => Self::EndPoll(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            Opcode::Error => Self::Error(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
        };

        Ok(payload)
    }

    /// Convert the payload into a transport frame.
    ///
    /// Encodes to CBOR, stamps the correct opcode into the header, and
    /// builds a [`Frame`] with automatic payload size calculation.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CborEncode`] if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse a payload from a raw transport frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownOpcode`] if the opcode is unassigned
    /// - [`ProtocolError::CborDecode`] if deserialization fails
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or_else(|| ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}
