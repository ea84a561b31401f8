//! Protocol error types.

use thiserror::Error;

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than a frame header.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header claims more payload bytes than the buffer holds.
    #[error("frame truncated: payload expected {expected} bytes, got {actual}")]
    FrameTruncated {
        /// Payload size the header claims
        expected: usize,
        /// Payload bytes actually present
        actual: usize,
    },

    /// Magic number does not identify a pollcast frame.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Protocol version is not supported by this build.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the protocol size limit.
    #[error("payload too large: {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Opcode is not part of this protocol version.
    ///
    /// Callers that tolerate protocol evolution should drop the frame
    /// instead of tearing down the connection.
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// CBOR serialization failed.
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
