//! Message router: dispatches inbound poll-layer frames.
//!
//! Decodes inbound envelopes by opcode and routes them: `vote` goes to
//! the poll engine, `start_poll`/`end_poll` are informational
//! re-broadcasts from the host-side administrative flow, and anything
//! unrecognized is dropped silently (logged, not fatal) so newer clients
//! can speak a superset of this protocol.
//!
//! The router does not enforce host-only permissions on the
//! administrative relays: that check belongs to the collaborator that
//! authorizes the action before the engine is invoked.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pollcast_core::{Environment, ParticipantId, PollError};
use pollcast_proto::{
    ErrorPayload, Frame, FrameHeader, Opcode, Payload,
};
use tokio::sync::mpsc;

use crate::{engine::PollEngine, error::ServerError, hub::RoomHub, storage::Storage};

/// The connection a frame arrived on: its room, the participant's
/// session identity, and the queue for direct (non-broadcast) replies.
pub struct InboundContext<'a> {
    /// Room the connection is registered in
    pub room_id: &'a str,
    /// Session identity of the sender; payload-claimed identities are
    /// ignored
    pub participant: ParticipantId,
    /// Outbound queue of the sending connection, for error replies
    pub outbound: &'a mpsc::Sender<Bytes>,
}

/// Routes decoded inbound messages to the poll engine and the hub.
pub struct MessageRouter<E, S>
where
    E: Environment,
    S: Storage,
{
    engine: Arc<PollEngine<E, S>>,
    hub: Arc<RoomHub>,
}

impl<E, S> MessageRouter<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Create a router dispatching to `engine` and relaying through
    /// `hub`.
    pub fn new(engine: Arc<PollEngine<E, S>>, hub: Arc<RoomHub>) -> Self {
        Self { engine, hub }
    }

    /// Route one inbound poll-layer frame.
    ///
    /// Never fails the connection: validation errors are replied to the
    /// sender, malformed payloads and unknown kinds are dropped with a
    /// log line.
    pub fn route(&self, ctx: &InboundContext<'_>, frame: &Frame) {
        match frame.header.opcode_enum() {
            Some(Opcode::Vote) => self.handle_vote(ctx, frame),
            Some(Opcode::StartPoll | Opcode::EndPoll) => self.relay(ctx, frame),
            Some(opcode) => {
                tracing::debug!(?opcode, "session-layer frame reached router; dropping");
            },
            None => {
                tracing::debug!(
                    opcode = frame.header.opcode(),
                    "unrecognized message kind; dropping"
                );
            },
        }
    }

    /// Decode a vote submission and hand it to the engine.
    fn handle_vote(&self, ctx: &InboundContext<'_>, frame: &Frame) {
        let vote = match Payload::from_frame(frame) {
            Ok(Payload::Vote(vote)) => vote,
            Ok(_) | Err(_) => {
                // Malformed payload: drop the message, keep the connection
                tracing::debug!(
                    participant = ctx.participant,
                    "malformed vote payload; dropping"
                );
                return;
            },
        };

        match self.engine.submit_vote(
            vote.poll_id,
            ctx.participant,
            vote.option_id,
            vote.time_to_answer_secs,
        ) {
            Ok(_) => {
                // The engine already broadcast the accepted vote
            },
            Err(e) => {
                tracing::debug!(
                    participant = ctx.participant,
                    poll_id = vote.poll_id,
                    %e,
                    "vote rejected"
                );
                self.reply_error(ctx, vote.poll_id, &e);
            },
        }
    }

    /// Re-broadcast a host-side administrative notice to the room.
    ///
    /// The payload is validated before relaying so the room never sees a
    /// frame this server could not itself decode.
    fn relay(&self, ctx: &InboundContext<'_>, frame: &Frame) {
        if let Err(e) = Payload::from_frame(frame) {
            tracing::debug!(participant = ctx.participant, %e, "malformed relay payload; dropping");
            return;
        }

        match self.hub.broadcast(ctx.room_id, frame) {
            Ok(delivered) => {
                tracing::debug!(
                    room_id = ctx.room_id,
                    opcode = frame.header.opcode(),
                    delivered,
                    "administrative notice relayed"
                );
            },
            Err(e) => {
                tracing::warn!(room_id = ctx.room_id, %e, "relay broadcast failed");
            },
        }
    }

    /// Send a client-visible rejection to the submitter only.
    fn reply_error(&self, ctx: &InboundContext<'_>, poll_id: u64, error: &ServerError) {
        let payload = error_payload(poll_id, error);

        let mut header = FrameHeader::new(Opcode::Error);
        header.set_poll_id(poll_id);

        let frame = match Payload::Error(payload).into_frame(header) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(%e, "failed to encode error reply");
                return;
            },
        };

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + frame.payload.len());
        if frame.encode(&mut buf).is_err() {
            return;
        }

        // Best-effort: a full queue here means the connection is stalled
        // and the next broadcast will evict it anyway.
        if ctx.outbound.try_send(buf.freeze()).is_err() {
            tracing::warn!(
                participant = ctx.participant,
                "could not deliver error reply; outbound queue unavailable"
            );
        }
    }
}

/// Translate an engine rejection into its wire representation.
fn error_payload(poll_id: u64, error: &ServerError) -> ErrorPayload {
    match error {
        ServerError::Poll(PollError::NotActive) => ErrorPayload::not_active(poll_id),
        ServerError::Poll(PollError::DuplicateVote(_)) => ErrorPayload::duplicate_vote(poll_id),
        ServerError::Poll(PollError::InvalidOption(option)) => {
            ErrorPayload::invalid_option(*option)
        },
        ServerError::PollNotFound(id) => ErrorPayload::poll_not_found(*id),
        ServerError::RoomNotFound(room) => ErrorPayload::room_not_found(room),
        other => ErrorPayload::rejected(other.to_string()),
    }
}
