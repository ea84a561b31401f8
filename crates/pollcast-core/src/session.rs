//! Session layer state machine.
//!
//! Manages connection lifecycle, heartbeats, timeouts, and graceful
//! shutdown for one participant connection. Uses the action pattern:
//! methods take time as input and return actions for the driver to
//! execute, which keeps the machine pure (no I/O) and easy to test.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  Hello (membership verified)  ┌────────┐
//! │ Init │──────────────────────────────>│ Joined │
//! └──────┘                               └────────┘
//!     │                                      │
//!     │ handshake timeout                    │ Goodbye / idle timeout
//!     ↓                                      ↓
//! ┌────────┐                            ┌────────┐
//! │ Closed │<───────────────────────────│ Closed │
//! └────────┘                            └────────┘
//! ```
//!
//! The driver verifies room membership with the storage collaborator
//! BEFORE calling [`Session::accept_join`]; the machine itself only
//! validates protocol-level properties.

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use pollcast_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::session::{Goodbye, Hello, HelloReply},
};

use crate::{error::SessionError, poll::ParticipantId};

/// Time allowed to complete the Hello handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time without any inbound activity before the connection is
/// closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the server sends Ping frames while joined.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Actions returned by the session state machine.
///
/// The driver (connection pump) executes these:
/// - `SendFrame`: enqueue the frame on the connection's outbound queue
/// - `Close`: tear the connection down with the given reason
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Close the connection with this reason
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for Hello
    Init,
    /// Admitted into a room, relaying broadcasts
    Joined,
    /// Connection closed (graceful or error)
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout for completing the Hello handshake
    pub handshake_timeout: Duration,
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be well below `idle_timeout`)
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Session state machine for a single connection.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug, Clone)]
pub struct Session<I = Instant>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    state: SessionState,
    config: SessionConfig,
    last_activity: I,
    last_heartbeat: Option<I>,
    participant: Option<ParticipantId>,
    room: Option<String>,
}

impl<I> Session<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a new session in [`SessionState::Init`].
    pub fn new(now: I, config: SessionConfig) -> Self {
        Self {
            state: SessionState::Init,
            config,
            last_activity: now,
            last_heartbeat: None,
            participant: None,
            room: None,
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Participant this session is joined as. `None` until joined.
    #[must_use]
    pub fn participant(&self) -> Option<ParticipantId> {
        self.participant
    }

    /// Room this session is joined to. `None` until joined.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Admit the session into its room after a Hello frame.
    ///
    /// The caller MUST have verified room membership with the membership
    /// authority first. Transitions to Joined and returns the HelloReply.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] if not in Init state
    /// - [`SessionError::UnsupportedVersion`] if the client speaks a
    ///   different protocol version
    pub fn accept_join(
        &mut self,
        hello: &Hello,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Init {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "accept_join",
            });
        }

        if hello.version != FrameHeader::VERSION {
            return Err(SessionError::UnsupportedVersion(hello.version));
        }

        self.state = SessionState::Joined;
        self.last_activity = now;
        self.participant = Some(hello.participant_id);
        self.room = Some(hello.room_id.clone());

        let reply = Payload::HelloReply(HelloReply {
            room_id: hello.room_id.clone(),
            participant_id: hello.participant_id,
        });
        let frame = reply.into_frame(FrameHeader::new(Opcode::HelloReply))?;

        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Mark the session as closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Record inbound activity (call when any frame arrives).
    pub fn touch(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Elapsed time since last activity, if the state's timeout was
    /// exceeded. `None` otherwise.
    #[must_use]
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        let elapsed = now - self.last_activity;

        let timeout = match self.state {
            SessionState::Init => self.config.handshake_timeout,
            SessionState::Joined => self.config.idle_timeout,
            SessionState::Closed => return None,
        };

        if elapsed > timeout { Some(elapsed) } else { None }
    }

    /// Periodic maintenance: timeout detection and heartbeat sending.
    pub fn tick(&mut self, now: I) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if let Some(elapsed) = self.check_timeout(now) {
            let reason = match self.state {
                SessionState::Init => format!("handshake timeout after {elapsed:?}"),
                _ => format!("idle timeout after {elapsed:?}"),
            };

            self.close();
            actions.push(SessionAction::Close { reason });
            return actions;
        }

        if self.state == SessionState::Joined {
            let due = match self.last_heartbeat {
                None => true,
                Some(last) => now - last >= self.config.heartbeat_interval,
            };

            if due {
                let ping = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
                actions.push(SessionAction::SendFrame(ping));
                self.last_heartbeat = Some(now);
            }
        }

        actions
    }

    /// Process an inbound session-layer frame.
    ///
    /// Handles Ping, Pong, Goodbye, and Error frames. Hello is NOT
    /// handled here - the driver intercepts it to consult the membership
    /// authority before calling [`Session::accept_join`].
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnexpectedFrame`] if the opcode is invalid for
    ///   the current state
    /// - [`SessionError::InvalidPayload`] if decoding fails
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.last_activity = now;

        let Some(opcode) = frame.header.opcode_enum() else {
            return Err(SessionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.header.opcode(),
            });
        };

        match (self.state, opcode) {
            (SessionState::Joined, Opcode::Ping) => {
                let pong = Frame::new(FrameHeader::new(Opcode::Pong), Vec::new());
                Ok(vec![SessionAction::SendFrame(pong)])
            },

            (SessionState::Joined, Opcode::Pong) => {
                // Activity already updated
                Ok(vec![])
            },

            (state, Opcode::Goodbye) if state != SessionState::Closed => {
                let payload = Payload::from_frame(frame)?;

                let reason = match payload {
                    Payload::Goodbye(goodbye) => goodbye.reason,
                    _ => {
                        return Err(SessionError::InvalidPayload {
                            expected: "Goodbye",
                            opcode: Opcode::Goodbye.to_u16(),
                        });
                    },
                };

                self.state = SessionState::Closed;

                let ack = Payload::Goodbye(Goodbye { reason: "ack".to_string() });
                let frame = ack.into_frame(FrameHeader::new(Opcode::Goodbye))?;

                Ok(vec![SessionAction::SendFrame(frame), SessionAction::Close {
                    reason: format!("peer goodbye: {reason}"),
                }])
            },

            (_, Opcode::Error) => {
                self.state = SessionState::Closed;
                Ok(vec![SessionAction::Close { reason: "peer error".to_string() }])
            },

            (state, opcode) => {
                Err(SessionError::UnexpectedFrame { state, opcode: opcode.to_u16() })
            },
        }
    }
}
