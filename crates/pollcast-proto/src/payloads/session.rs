//! Session-layer payloads: handshake and connection lifecycle.

use serde::{Deserialize, Serialize};

/// Client handshake, sent as the first frame on a new connection.
///
/// Identifies the participant and the room to join. The server consults
/// the room membership authority before admitting the connection; the
/// participant identity itself is established by the credential
/// collaborator before the transport is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the client speaks
    pub version: u8,
    /// Room the client wants to join
    pub room_id: String,
    /// Participant identity (user id)
    pub participant_id: u64,
    /// Opaque credential for the auth collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Server acknowledgement of a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Room the connection is registered under
    pub room_id: String,
    /// Participant the connection is registered as
    pub participant_id: u64,
}

/// Graceful disconnect notice, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable reason for disconnecting
    pub reason: String,
}
