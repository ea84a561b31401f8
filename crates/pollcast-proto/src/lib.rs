//! Pollcast wire protocol.
//!
//! The wire envelope is a fixed 32-byte binary header (the message `type`
//! is a `u16` opcode) followed by a variable-length CBOR payload. Headers
//! are raw binary so the server can route frames without touching the
//! payload; payloads are CBOR for type safety and forward compatibility.
//!
//! # Layers
//!
//! - [`FrameHeader`]: fixed header, zero-copy parsed from network bytes
//! - [`Frame`]: header + raw payload bytes (transport layer)
//! - [`Payload`]: typed payload enum (logic layer)

mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Payload};

/// ALPN protocol identifier for QUIC transport negotiation.
pub const ALPN_PROTOCOL: &[u8] = b"pollcast";
