//! Frame type combining header and payload.
//!
//! A `Frame` is the transport-layer packet: a 32-byte binary header plus
//! variable-length raw bytes (already CBOR-encoded). It is a pure data
//! holder; for typed payloads see `Payload::into_frame()` and
//! `Payload::from_frame()`.

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame.
///
/// Layout on the wire: `[FrameHeader: 32 bytes] + [payload: variable]`.
///
/// Holds raw bytes, NOT the `Payload` enum, so the hub can fan a frame
/// out to a room without deserializing it.
///
/// # Invariants
///
/// - `payload.len()` matches `header.payload_size()`. Enforced by
///   [`Frame::new`] and verified by [`Frame::decode`].
/// - `payload.len()` never exceeds [`FrameHeader::MAX_PAYLOAD_SIZE`].
///   Violations are rejected during encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header (32 bytes)
    pub header: FrameHeader,

    /// Raw payload bytes (already CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with automatic `payload_size` calculation.
    ///
    /// The header's size field is set to match the actual payload length,
    /// so header and payload cannot disagree.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        // INVARIANT: payload length fits in u32 - Bytes is bounded by
        // isize::MAX and MAX_PAYLOAD_SIZE (64 KiB) << u32::MAX.
        #[allow(clippy::expect_used)]
        let payload_len =
            u32::try_from(payload.len()).expect("invariant: payload length fits in u32");

        header.set_payload_size(payload_len);

        Self { header, payload }
    }

    /// Encode the frame into a buffer.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    ///   [`FrameHeader::MAX_PAYLOAD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode a frame from wire format.
    ///
    /// Returns a frame with raw payload bytes; it does NOT deserialize
    /// CBOR. Trailing bytes beyond the claimed payload size are ignored.
    ///
    /// # Errors
    ///
    /// - Any header parse error from [`FrameHeader::from_bytes`]
    /// - [`ProtocolError::FrameTruncated`] if fewer payload bytes are
    ///   present than the header claims
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        if bytes.len() < total_size {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        }

        // INVARIANT: bytes.len() >= total_size was checked above, so this
        // slice cannot be out of bounds.
        #[allow(clippy::expect_used)]
        let payload = Bytes::copy_from_slice(
            bytes.get(FrameHeader::SIZE..total_size).expect("invariant: bounds checked above"),
        );

        Ok(Self { header: *header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opcode;

    #[test]
    fn frame_with_payload_round_trip() {
        let mut header = FrameHeader::new(Opcode::Vote);
        header.set_sender_id(9);

        let frame = Frame::new(header, vec![1, 2, 3, 4]);
        assert_eq!(frame.header.payload_size(), 4);

        let mut wire = Vec::new();
        frame.encode(&mut wire).unwrap();

        let parsed = Frame::decode(&wire).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.header.sender_id(), 9);
    }

    #[test]
    fn empty_payload_round_trip() {
        let frame = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());

        let mut wire = Vec::new();
        frame.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), FrameHeader::SIZE);

        let parsed = Frame::decode(&wire).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn reject_truncated_frame() {
        let mut header = FrameHeader::new(Opcode::Vote);
        header.set_payload_size(100);

        // Only the header, no payload
        let result = Frame::decode(&header.to_bytes());
        assert!(matches!(result, Err(ProtocolError::FrameTruncated { .. })));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let frame = Frame::new(FrameHeader::new(Opcode::Pong), vec![7u8; 3]);

        let mut wire = Vec::new();
        frame.encode(&mut wire).unwrap();
        wire.extend_from_slice(&[0xAA; 10]);

        let parsed = Frame::decode(&wire).unwrap();
        assert_eq!(parsed.payload.len(), 3);
    }
}
