//! Per-connection inbound and outbound pumps.
//!
//! Each connection runs two independent tasks that share nothing but the
//! bounded outbound queue:
//!
//! - the **inbound pump** (this module's main loop) reads raw bytes from
//!   the QUIC recv stream, reassembles frames, drives the session state
//!   machine, and hands poll frames to the router;
//! - the **outbound pump** drains the queue and writes frames to the
//!   QUIC send stream, coalescing whatever queued while a write was in
//!   flight.
//!
//! # Queue ownership and teardown
//!
//! The hub holds the only strong sender for a joined connection; the
//! inbound pump keeps a weak one. When the hub evicts the connection
//! (queue overflow) or replaces it (re-join), the strong sender is
//! dropped, the outbound pump sees the closed queue, finishes, and
//! closes the transport - which in turn ends the inbound pump's read.
//! Either pump can therefore shut down without waiting on the other.

use std::{ops::ControlFlow, sync::Arc};

use bytes::{Bytes, BytesMut};
use pollcast_core::{
    Environment, ParticipantId, RoomId, Session, SessionAction, SessionConfig, SessionState,
};
use pollcast_proto::{ErrorPayload, Frame, FrameHeader, Opcode, Payload};
use tokio::{io::AsyncReadExt, sync::mpsc};

use crate::{
    error::ServerError,
    hub::RoomHub,
    router::{InboundContext, MessageRouter},
    storage::Storage,
    transport::QuinnConnection,
};

/// Session maintenance cadence (timeouts, heartbeats).
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Per-connection settings, carved out of the server config.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    /// Outbound queue capacity (messages)
    pub queue_capacity: usize,
    /// Session state machine configuration
    pub session: SessionConfig,
}

/// Inbound-pump state for one connection.
struct ConnectionActor<E, S>
where
    E: Environment,
    S: Storage,
{
    hub: Arc<RoomHub>,
    router: Arc<MessageRouter<E, S>>,
    storage: S,
    env: E,
    session: Session<E::Instant>,
    /// Strong sender, held only until the hub takes ownership on join
    local_tx: Option<mpsc::Sender<Bytes>>,
    /// Weak sender for replies after join; failing to upgrade means the
    /// hub evicted or replaced this connection
    weak_tx: mpsc::WeakSender<Bytes>,
    joined: Option<(RoomId, ParticipantId)>,
}

/// Run one connection to completion.
///
/// Accepts the client's session stream, spawns the outbound pump, and
/// runs the inbound pump until the transport fails, the session closes,
/// or the hub drops the connection.
pub(crate) async fn run_connection<E, S>(
    conn: QuinnConnection,
    hub: Arc<RoomHub>,
    router: Arc<MessageRouter<E, S>>,
    storage: S,
    env: E,
    settings: ConnectionSettings,
) -> Result<(), ServerError>
where
    E: Environment,
    S: Storage,
{
    let remote = conn.remote_addr();

    let (send, mut recv) =
        tokio::time::timeout(settings.session.handshake_timeout, conn.accept_bi())
            .await
            .map_err(|_| {
                ServerError::Transport("timed out waiting for session stream".to_string())
            })??;

    let (tx, rx) = mpsc::channel::<Bytes>(settings.queue_capacity);
    let weak_tx = tx.downgrade();
    let writer = tokio::spawn(outbound_pump(rx, send, conn.clone()));

    let mut actor = ConnectionActor {
        hub,
        router,
        storage,
        env: env.clone(),
        session: Session::new(env.now(), settings.session.clone()),
        local_tx: Some(tx),
        weak_tx,
        joined: None,
    };

    let mut acc = BytesMut::with_capacity(4096);
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            read = recv.read_buf(&mut acc) => match read {
                Ok(0) => break "peer finished stream".to_string(),
                Ok(_) => {
                    if let ControlFlow::Break(reason) = actor.drain_frames(&mut acc) {
                        break reason;
                    }
                },
                Err(e) => break format!("read error: {e}"),
            },
            _ = tick.tick() => {
                if let ControlFlow::Break(reason) = actor.tick() {
                    break reason;
                }
            },
        }
    };

    tracing::debug!(%remote, %reason, "connection closing");
    actor.cleanup();
    drop(actor);

    // Wait for the outbound pump to flush queued frames (e.g. a Goodbye
    // ack) and close the transport.
    let _ = writer.await;

    Ok(())
}

impl<E, S> ConnectionActor<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Parse and handle every complete frame in the accumulator.
    fn drain_frames(&mut self, acc: &mut BytesMut) -> ControlFlow<String> {
        loop {
            if acc.len() < FrameHeader::SIZE {
                return ControlFlow::Continue(());
            }

            let header = match FrameHeader::from_bytes(&acc[..FrameHeader::SIZE]) {
                Ok(header) => *header,
                // Header-level garbage means framing is lost; the
                // connection cannot be resynchronized
                Err(e) => return ControlFlow::Break(format!("invalid frame header: {e}")),
            };

            let total = FrameHeader::SIZE + header.payload_size() as usize;
            if acc.len() < total {
                return ControlFlow::Continue(());
            }

            let frame_bytes = acc.split_to(total).freeze();
            let frame = Frame { header, payload: frame_bytes.slice(FrameHeader::SIZE..) };

            self.handle_frame(&frame)?;
        }
    }

    /// Dispatch one inbound frame.
    fn handle_frame(&mut self, frame: &Frame) -> ControlFlow<String> {
        let now = self.env.now();

        match frame.header.opcode_enum() {
            Some(Opcode::Hello) => self.handle_hello(frame, now),

            Some(
                Opcode::HelloReply
                | Opcode::Ping
                | Opcode::Pong
                | Opcode::Goodbye
                | Opcode::Error,
            ) => match self.session.handle_frame(frame, now) {
                Ok(actions) => self.execute(actions),
                Err(e) => ControlFlow::Break(format!("session protocol error: {e}")),
            },

            // Poll-layer frames and unrecognized kinds go to the router,
            // which drops what it does not know
            Some(Opcode::StartPoll | Opcode::Vote | Opcode::EndPoll) | None => {
                self.session.touch(now);
                self.route(frame)
            },
        }
    }

    /// Admission: verify membership, join the session, hand the outbound
    /// queue to the hub.
    fn handle_hello(&mut self, frame: &Frame, now: E::Instant) -> ControlFlow<String> {
        if self.session.state() != SessionState::Init {
            return ControlFlow::Break("unexpected Hello after join".to_string());
        }

        let hello = match Payload::from_frame(frame) {
            Ok(Payload::Hello(hello)) => hello,
            Ok(_) | Err(_) => {
                return ControlFlow::Break("malformed Hello payload".to_string());
            },
        };

        let admitted = match self.storage.is_participant(&hello.room_id, hello.participant_id) {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::warn!(%e, "membership lookup failed");
                let _ = self
                    .enqueue_payload(Payload::Error(ErrorPayload::rejected("admission failed")));
                return ControlFlow::Break("membership lookup failed".to_string());
            },
        };

        if !admitted {
            let _ = self.enqueue_payload(Payload::Error(ErrorPayload::not_participant(
                &hello.room_id,
            )));
            return ControlFlow::Break(format!(
                "participant {} is not a member of room {}",
                hello.participant_id, hello.room_id
            ));
        }

        let actions = match self.session.accept_join(&hello, now) {
            Ok(actions) => actions,
            Err(e) => {
                let _ =
                    self.enqueue_payload(Payload::Error(ErrorPayload::rejected(e.to_string())));
                return ControlFlow::Break(format!("handshake rejected: {e}"));
            },
        };

        // The HelloReply is enqueued before the hub takes the sender so
        // it precedes any broadcast
        self.execute(actions)?;

        if let Some(tx) = self.local_tx.take() {
            self.hub.join(&hello.room_id, hello.participant_id, tx);
        }
        self.joined = Some((hello.room_id.clone(), hello.participant_id));

        tracing::info!(
            room_id = %hello.room_id,
            participant = hello.participant_id,
            "participant joined"
        );

        ControlFlow::Continue(())
    }

    /// Hand a poll-layer frame to the router.
    fn route(&self, frame: &Frame) -> ControlFlow<String> {
        let Some((room_id, participant)) = &self.joined else {
            tracing::debug!("poll frame before join; dropping");
            return ControlFlow::Continue(());
        };

        let Some(sender) = self.sender() else {
            return ControlFlow::Break("connection dropped by hub".to_string());
        };

        let ctx = InboundContext { room_id, participant: *participant, outbound: &sender };
        self.router.route(&ctx, frame);

        ControlFlow::Continue(())
    }

    /// Run session maintenance (timeouts, heartbeats).
    fn tick(&mut self) -> ControlFlow<String> {
        let actions = self.session.tick(self.env.now());
        self.execute(actions)
    }

    /// Execute session actions against the outbound queue.
    fn execute(&mut self, actions: Vec<SessionAction>) -> ControlFlow<String> {
        for action in actions {
            match action {
                SessionAction::SendFrame(frame) => {
                    if let Err(e) = self.enqueue(&frame) {
                        return ControlFlow::Break(e.to_string());
                    }
                },
                SessionAction::Close { reason } => return ControlFlow::Break(reason),
            }
        }

        ControlFlow::Continue(())
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.local_tx.clone().or_else(|| self.weak_tx.upgrade())
    }

    /// Enqueue a frame on this connection's own outbound queue.
    fn enqueue(&self, frame: &Frame) -> Result<(), ServerError> {
        let Some(sender) = self.sender() else {
            return Err(ServerError::Transport("outbound queue gone".to_string()));
        };

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + frame.payload.len());
        frame.encode(&mut buf)?;

        sender.try_send(buf.freeze()).map_err(|_| {
            ServerError::ConnectionOverflow(self.joined.as_ref().map_or(0, |(_, p)| *p))
        })
    }

    fn enqueue_payload(&self, payload: Payload) -> Result<(), ServerError> {
        let opcode = payload.opcode();
        let frame = payload.into_frame(FrameHeader::new(opcode))?;
        self.enqueue(&frame)
    }

    /// Leave the hub (unless a re-join already replaced this connection)
    /// and release the outbound queue.
    fn cleanup(&mut self) {
        self.session.close();

        if let Some((room_id, participant)) = self.joined.take() {
            if let Some(sender) = self.weak_tx.upgrade() {
                if self.hub.leave_if_same(&room_id, participant, &sender) {
                    tracing::debug!(%room_id, participant, "connection left room");
                }
            }
        }

        self.local_tx = None;
    }
}

/// Outbound pump: drain the bounded queue and write frames to the
/// transport.
///
/// Terminates when the queue closes (hub eviction, re-join replacement,
/// or inbound cleanup) or on a write error, then closes the transport so
/// the inbound pump unblocks.
async fn outbound_pump(
    mut rx: mpsc::Receiver<Bytes>,
    mut send: quinn::SendStream,
    conn: QuinnConnection,
) {
    'drain: while let Some(bytes) = rx.recv().await {
        if send.write_all(&bytes).await.is_err() {
            break 'drain;
        }

        // Coalesce messages that queued while the write was in flight
        while let Ok(more) = rx.try_recv() {
            if send.write_all(&more).await.is_err() {
                break 'drain;
            }
        }
    }

    let _ = send.finish();
    conn.close(0u32.into(), b"connection closed");
}
