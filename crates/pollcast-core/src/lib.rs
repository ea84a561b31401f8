//! Pollcast core logic.
//!
//! Pure state machines with no I/O, following the Sans-IO pattern: methods
//! take the current time as input and return actions or values for a
//! driver to execute. Both machines are generic over the `Instant` type so
//! tests can drive them with virtual time.
//!
//! # Components
//!
//! - [`poll::Poll`]: poll lifecycle (Pending → Active → Closed), vote
//!   deduplication, and result tallying
//! - [`session::Session`]: per-connection handshake, heartbeat, and
//!   timeout handling
//! - [`env::Environment`]: time/RNG abstraction implemented by production
//!   and test drivers

pub mod env;
pub mod error;
pub mod poll;
pub mod session;

pub use env::Environment;
pub use error::{PollError, SessionError};
pub use poll::{OptionId, ParticipantId, Poll, PollId, PollOption, PollState, RoomId, Vote};
pub use session::{Session, SessionAction, SessionConfig, SessionState};
