//! # Endpoint
//!
//! One UDP socket, the peers reachable through it, and the threads that keep
//! them moving.
//!
//! ```text
//!              submit_message / connect
//!                        │
//!   ┌──────────── Shared ▼──────────────────────────────────────┐
//!   │ EstablishmentManager   peers: RemoteHostId → PeerSession  │
//!   │ AckScheduler           handles: (peer, message id) → ...  │
//!   └──────▲─────────────────────▲──────────────▲───────────────┘
//!          │                     │              │
//!   skiff-recv              skiff-pump      skiff-acks        skiff-delivery
//!   open → decode →         sweep, expire,  drain ACK batch   NodeEvent → events()
//!   handshake / data        (re)send frags  → Data packet
//! ```
//!
//! Handshake packets are sealed with the intro key (`None`); data and
//! destroy packets of an established session with its session keys. An
//! incoming datagram is tried against the session keys first.
//!
//! Lock order: establishment table, then a handshake, then `peers`. The
//! `handles` and `identities` maps are leaf locks.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use skiff_transport::ack::{AckBitfield, AckScheduler};
use skiff_transport::clock::{Clock, MonotonicClock};
use skiff_transport::crypto::{CryptoService, PeerId, SessionKeys};
use skiff_transport::establish::{AbandonedHandshake, EstablishError, EstablishmentManager, Handshake};
use skiff_transport::handshake::{
    EstablishedSession, FailureReason, HandshakeError, InboundHandshake, InboundState,
    OutboundAction, OutboundHandshake, QueuedMessage, RemoteHostId, Role, TokenCheck,
    MAX_OUTBOUND_ESTABLISH_MS,
};
use skiff_transport::outbound::{FailureCause, OutboundError};
use skiff_transport::pool::FragmentPool;
use skiff_transport::reassembly::{CompletedMessage, Received};
use skiff_transport::runtime::{AckSender, MessageDelivery};
use skiff_transport::session::PeerSession;
use skiff_transport::stats::{HandshakeStats, ReceiverStats, SenderStats};
use skiff_transport::wire::{
    DataPacket, FragmentFrame, Packet, SessionConfirmed, SessionCreated, SessionRequest, HEADER_SIZE,
    MAX_WIRE_COUNT,
};

use crate::config::NodeConfig;
use crate::socket::{bind_udp, is_timeout, DatagramSocket};

const MAX_DATAGRAM: usize = 65_535;

/// Pump tick when nothing wakes it sooner.
const PUMP_INTERVAL_MS: u64 = 10;

/// Fits the minimum MTU even when every ACK is a 5-byte bitfield.
const MAX_ACKS_PER_PACKET: usize = 48;

const DESTROY_REASON_CLOSED: u8 = 0;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Public types ───────────────────────────────────────────────────────────

/// Identifies a submitted message in later events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFailure {
    /// The handshake it was waiting on failed.
    Handshake(FailureReason),
    /// Given up on after establishment.
    Delivery(FailureCause),
    /// The session could not take it.
    Rejected(OutboundError),
    /// The session closed before it was acknowledged.
    Closed,
}

impl fmt::Display for MessageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageFailure::Handshake(reason) => write!(f, "handshake failed: {reason}"),
            MessageFailure::Delivery(FailureCause::TooManySends) => f.write_str("too many sends"),
            MessageFailure::Delivery(FailureCause::Expired) => f.write_str("expired"),
            MessageFailure::Rejected(e) => write!(f, "rejected: {e}"),
            MessageFailure::Closed => f.write_str("session closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    HandshakeComplete {
        peer: SocketAddr,
        peer_id: PeerId,
    },
    HandshakeFailed {
        peer: SocketAddr,
        reason: FailureReason,
    },
    MessageComplete {
        peer: SocketAddr,
        message_id: u32,
        payload: Bytes,
    },
    MessageAcked {
        peer: SocketAddr,
        handle: MessageHandle,
    },
    MessageFailed {
        peer: SocketAddr,
        handle: MessageHandle,
        failure: MessageFailure,
    },
    SessionClosed {
        peer: SocketAddr,
    },
}

impl NodeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::HandshakeComplete { .. } => "handshake-complete",
            NodeEvent::HandshakeFailed { .. } => "handshake-failed",
            NodeEvent::MessageComplete { .. } => "message-complete",
            NodeEvent::MessageAcked { .. } => "message-acked",
            NodeEvent::MessageFailed { .. } => "message-failed",
            NodeEvent::SessionClosed { .. } => "session-closed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
    pub rtt_ms: u64,
    pub rto_ms: u64,
    /// Bytes per millisecond.
    pub bandwidth: f64,
    pub congestion_window: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub handshakes: HandshakeStats,
    pub peers: usize,
    pub pool_available: usize,
    pub pool_exhausted: u64,
    /// Summed over live sessions.
    pub receiver: ReceiverStats,
    pub send_errors: u64,
    pub dropped_events: u64,
}

// ─── Shared state ───────────────────────────────────────────────────────────

struct Shared {
    config: NodeConfig,
    local_addr: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    crypto: Arc<dyn CryptoService>,
    clock: Arc<dyn Clock>,
    pool: Arc<FragmentPool>,
    establishment: EstablishmentManager,
    peers: Mutex<HashMap<RemoteHostId, Arc<PeerSession>>>,
    /// Address book filled by `connect`.
    identities: Mutex<HashMap<RemoteHostId, Bytes>>,
    handles: Mutex<HashMap<(RemoteHostId, u32), MessageHandle>>,
    acks: Arc<AckScheduler<RemoteHostId>>,
    delivery: MessageDelivery<NodeEvent>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    running: AtomicBool,
    next_handle: AtomicU64,
    send_errors: AtomicU64,
    dropped_events: AtomicU64,
}

/// A session installed under its handshake's lock, not yet announced.
struct Promotion {
    session: Arc<PeerSession>,
    queued: Vec<QueuedMessage>,
    replaced: Option<Arc<PeerSession>>,
}

impl Shared {
    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Header send time, seconds since the epoch.
    fn wire_time(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    fn peer(&self, remote: &RemoteHostId) -> Option<Arc<PeerSession>> {
        lock(&self.peers).get(remote).cloned()
    }

    fn emit(&self, event: NodeEvent) {
        let kind = event.kind();
        if let Err(e) = self.delivery.deliver(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!(kind, error = %e, "event dropped");
        }
    }

    /// Hand a completed message to the application, then acknowledge it.
    /// A message the delivery queue refuses stays unacknowledged and held,
    /// so the sender's next retransmission offers it again.
    fn deliver_message(
        &self,
        session: &PeerSession,
        message: CompletedMessage,
        ack: AckBitfield,
        now: u64,
    ) {
        let remote = session.remote();
        let event = NodeEvent::MessageComplete {
            peer: remote.socket_addr(),
            message_id: message.message_id,
            payload: message.payload.clone(),
        };
        let kind = event.kind();
        match self.delivery.deliver(event) {
            Ok(()) => self.acks.add_pending(&remote, ack, now),
            Err(e) => {
                let message_id = message.message_id;
                if session.hold_undelivered(message) {
                    debug!(peer = %remote, message_id, error = %e, "delivery deferred");
                } else {
                    // Nothing held, so a retransmission cannot complete it again.
                    self.acks.add_pending(&remote, ack, now);
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                    warn!(kind, peer = %remote, message_id, error = %e, "event dropped");
                }
            }
        }
    }

    fn send_packet(&self, remote: RemoteHostId, keys: Option<&SessionKeys>, packet: &Packet) {
        let plaintext = match packet.encode(self.wire_time()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %remote, error = %e, "packet encode failed");
                return;
            }
        };
        let datagram = match self.crypto.seal(keys, &plaintext) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %remote, error = %e, "seal failed");
                return;
            }
        };
        match self.socket.send_to(&datagram, remote.socket_addr()) {
            Ok(_) => trace!(peer = %remote, kind = ?packet.payload_type(), len = datagram.len(), "sent"),
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %remote, error = %e, "send failed");
            }
        }
    }

    // ─── Receive path ───────────────────────────────────────────────────

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let remote = RemoteHostId::from(from);
        let now = self.now();
        let session = self.peer(&remote);

        let session_plaintext = session
            .as_ref()
            .and_then(|s| self.crypto.open(Some(s.keys()), datagram).ok());
        let (plaintext, keyed) = match session_plaintext {
            Some(p) => (p, true),
            None => match self.crypto.open(None, datagram) {
                Ok(p) => (p, false),
                Err(e) => {
                    debug!(peer = %remote, error = %e, "dropping datagram that failed to open");
                    return;
                }
            },
        };
        let packet = match Packet::decode(plaintext) {
            Ok((_, packet)) => packet,
            Err(e) => {
                debug!(peer = %remote, error = %e, "dropping malformed packet");
                return;
            }
        };
        trace!(peer = %remote, kind = ?packet.payload_type(), keyed, "received");

        match packet {
            Packet::Data(data) => match session.filter(|_| keyed) {
                Some(session) => self.on_data(&session, data, now),
                None => debug!(peer = %remote, "data without an established session"),
            },
            Packet::SessionDestroyed { reason } => self.on_destroyed(remote, reason, keyed),
            Packet::TokenRequest => self.on_token_request(remote, now),
            Packet::Retry { token } => self.on_retry(remote, token, now),
            Packet::SessionRequest(req) => self.on_session_request(remote, &req, now),
            Packet::SessionCreated(created) => self.on_session_created(remote, &created, session, now),
            Packet::SessionConfirmed(confirmed) => self.on_session_confirmed(remote, &confirmed, now),
        }
    }

    fn on_data(&self, session: &PeerSession, data: DataPacket, now: u64) {
        let remote = session.remote();
        let peer = remote.socket_addr();

        if !data.acks.is_empty() {
            let summary = session.on_acks(&data.acks, now);
            if !summary.completed.is_empty() {
                let acked: Vec<MessageHandle> = {
                    let mut handles = lock(&self.handles);
                    summary
                        .completed
                        .iter()
                        .filter_map(|id| handles.remove(&(remote, *id)))
                        .collect()
                };
                for handle in acked {
                    self.emit(NodeEvent::MessageAcked { peer, handle });
                }
            }
        }

        for frame in &data.fragments {
            match session.receive_fragment(frame, now) {
                Ok(Received::Completed { message, ack }) => {
                    debug!(
                        peer = %remote,
                        message_id = message.message_id,
                        bytes = message.payload.len(),
                        "message complete"
                    );
                    self.deliver_message(session, message, ack, now);
                }
                Ok(received) => self.acks.add_pending(&remote, received.ack(), now),
                Err(e) => debug!(
                    peer = %remote,
                    message_id = frame.message_id,
                    index = frame.index,
                    error = %e,
                    "fragment dropped"
                ),
            }
        }
    }

    fn on_destroyed(&self, remote: RemoteHostId, reason: u8, keyed: bool) {
        if self.peer(&remote).is_some() {
            if !keyed {
                debug!(peer = %remote, "ignoring destroy not sealed with session keys");
                return;
            }
            info!(peer = %remote, reason, "peer closed session");
            self.drop_session(&remote, false);
        } else {
            self.abandon_handshake(remote, FailureReason::Destroyed);
        }
    }

    // ─── Responder ──────────────────────────────────────────────────────

    /// Responder handshake for `remote`, creating it on first contact.
    fn inbound(&self, remote: RemoteHostId, now: u64) -> Option<Arc<Mutex<InboundHandshake>>> {
        match self.establishment.inbound_for(remote, now) {
            Ok((h, _)) => Some(h),
            Err(EstablishError::Busy { .. }) if self.yields_to(&remote) => {
                // Both sides connected at once; the larger identity gives up
                // its outbound attempt and carries the queued messages over.
                let requeue = self
                    .establishment
                    .fail(&remote, FailureReason::Rejected)
                    .map(|ab| ab.queued)
                    .unwrap_or_default();
                debug!(peer = %remote, requeued = requeue.len(), "simultaneous connect, yielding");
                let h = match self.establishment.inbound_for(remote, now) {
                    Ok((h, _)) => h,
                    Err(e) => {
                        debug!(peer = %remote, error = %e, "inbound handshake refused");
                        self.fail_messages(remote, requeue, MessageFailure::Handshake(FailureReason::Rejected));
                        return None;
                    }
                };
                let mut rejected = Vec::new();
                {
                    let mut hs = lock(&h);
                    for msg in requeue {
                        let handle = msg.handle;
                        if hs.queue_message(msg).is_err() {
                            rejected.push(handle);
                        }
                    }
                }
                for handle in rejected {
                    self.emit(NodeEvent::MessageFailed {
                        peer: remote.socket_addr(),
                        handle: MessageHandle(handle),
                        failure: MessageFailure::Handshake(FailureReason::Rejected),
                    });
                }
                Some(h)
            }
            Err(e) => {
                debug!(peer = %remote, error = %e, "inbound handshake refused");
                None
            }
        }
    }

    fn yields_to(&self, remote: &RemoteHostId) -> bool {
        let ours = self.crypto.local_identity();
        lock(&self.identities)
            .get(remote)
            .is_some_and(|theirs| ours > *theirs)
    }

    fn on_token_request(&self, remote: RemoteHostId, now: u64) {
        if !self.establishment.version().uses_tokens() {
            debug!(peer = %remote, "token request while tokens are disabled");
            return;
        }
        let Some(h) = self.inbound(remote, now) else {
            return;
        };
        let existing = lock(&h).retry_token();
        let token = existing.unwrap_or_else(|| self.establishment.issue_token(remote, now));
        let result = lock(&h).receive_token_request(token, now);
        match result {
            Ok(()) => self.respond_inbound(remote, &h, now),
            Err(e) => self.on_handshake_error(remote, e),
        }
    }

    fn on_session_request(
        &self,
        remote: RemoteHostId,
        req: &SessionRequest,
        now: u64,
    ) {
        if let Some(session) = self.peer(&remote) {
            if now.saturating_sub(session.established_ms()) < MAX_OUTBOUND_ESTABLISH_MS {
                trace!(peer = %remote, "stale session request");
                return;
            }
            info!(peer = %remote, "new session request from established peer, replacing session");
            self.drop_session(&remote, false);
        }
        let Some(h) = self.inbound(remote, now) else {
            return;
        };
        let retransmit = matches!(
            lock(&h).state(),
            InboundState::RequestReceived | InboundState::CreatedSent
        );
        let check = if retransmit {
            TokenCheck::NotRequired
        } else {
            self.establishment.check_token(&remote, req.token, now)
        };
        let result = lock(&h).receive_session_request(req, check, now);
        match result {
            Ok(()) => self.respond_inbound(remote, &h, now),
            Err(e) => self.on_handshake_error(remote, e),
        }
    }

    /// Send whatever the responder owes in its current state.
    fn respond_inbound(&self, remote: RemoteHostId, h: &Mutex<InboundHandshake>, now: u64) {
        let (state, token) = {
            let hs = lock(h);
            (hs.state(), hs.retry_token())
        };
        let result = match state {
            InboundState::TokenRequestReceived
            | InboundState::RequestBadTokenReceived
            | InboundState::RetrySent => {
                let token = match token {
                    Some(t) => t,
                    None => {
                        let t = self.establishment.issue_token(remote, now);
                        lock(h).set_retry_token(t);
                        t
                    }
                };
                let mut hs = lock(h);
                self.send_packet(remote, None, &Packet::Retry { token });
                hs.retry_packet_sent(now)
            }
            InboundState::RequestReceived
            | InboundState::CreatedSent
            | InboundState::ConfirmedPartially => {
                let mut hs = lock(h);
                match hs.prepare_created(self.crypto.as_ref(), 0, self.wire_time()) {
                    Ok(created) => {
                        self.send_packet(remote, None, &Packet::SessionCreated(created));
                        hs.created_packet_sent(now).map(drop)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.on_handshake_error(remote, e);
        }
    }

    fn on_session_confirmed(
        &self,
        remote: RemoteHostId,
        confirmed: &SessionConfirmed,
        now: u64,
    ) {
        let Some(Handshake::Inbound(h)) = self.establishment.get(&remote) else {
            trace!(peer = %remote, "confirmation without a responder handshake");
            return;
        };
        let mut hs = lock(&h);
        let result = match hs.receive_session_confirmed(confirmed, now) {
            Ok(()) if hs.state() == InboundState::ConfirmedCompletely => {
                hs.verify_identity(self.crypto.as_ref(), now).map(Some)
            }
            Ok(()) => Ok(None),
            Err(e) => Err(e),
        };
        match result {
            Ok(Some(established)) => {
                let promotion = self.install_session(established);
                drop(hs);
                self.finish_promotion(promotion, now);
            }
            Ok(None) => {}
            Err(e) => {
                drop(hs);
                self.on_handshake_error(remote, e);
            }
        }
    }

    // ─── Initiator ──────────────────────────────────────────────────────

    fn start_outbound(&self, remote: RemoteHostId, msg: Option<QueuedMessage>, now: u64) -> Result<()> {
        let identity = lock(&self.identities)
            .get(&remote)
            .cloned()
            .ok_or_else(|| anyhow!("no identity known for {remote}; call connect first"))?;
        let (h, created) = self
            .establishment
            .begin_outbound(remote, identity, now)
            .with_context(|| format!("starting handshake with {remote}"))?;
        if let Some(msg) = msg {
            lock(&h)
                .queue_message(msg)
                .with_context(|| format!("queueing message for {remote}"))?;
        }
        if created {
            self.drive_outbound(remote, &h, now);
        }
        Ok(())
    }

    /// Send the initiator's next packet; promote if that completes it.
    fn drive_outbound(&self, remote: RemoteHostId, h: &Mutex<OutboundHandshake>, now: u64) {
        let mut hs = lock(h);
        let result = match hs.next_action() {
            OutboundAction::TokenRequest => {
                self.send_packet(remote, None, &Packet::TokenRequest);
                hs.token_request_sent(now).map(|_| None)
            }
            OutboundAction::SessionRequest => match hs.prepare_request(self.crypto.as_ref()) {
                Ok(req) => {
                    self.send_packet(remote, None, &Packet::SessionRequest(req));
                    hs.request_sent(now).map(|_| None)
                }
                Err(e) => Err(e),
            },
            OutboundAction::SessionConfirmed => {
                match hs.prepare_confirmed(self.crypto.as_ref(), self.wire_time()) {
                    Ok(fragments) => {
                        for fragment in fragments {
                            self.send_packet(remote, None, &Packet::SessionConfirmed(fragment));
                        }
                        hs.confirmed_sent(now).map(Some)
                    }
                    Err(e) => Err(e),
                }
            }
            OutboundAction::None => Ok(None),
        };
        match result {
            Ok(Some(established)) => {
                let promotion = self.install_session(established);
                drop(hs);
                self.finish_promotion(promotion, now);
            }
            Ok(None) => {}
            Err(e) => {
                drop(hs);
                self.on_handshake_error(remote, e);
            }
        }
    }

    fn on_retry(&self, remote: RemoteHostId, token: u64, now: u64) {
        let Some(Handshake::Outbound(h)) = self.establishment.get(&remote) else {
            trace!(peer = %remote, "retry without an initiator handshake");
            return;
        };
        let result = lock(&h).receive_retry(token, now);
        match result {
            Ok(()) => self.drive_outbound(remote, &h, now),
            Err(e) => self.on_handshake_error(remote, e),
        }
    }

    fn on_session_created(
        &self,
        remote: RemoteHostId,
        created: &SessionCreated,
        session: Option<Arc<PeerSession>>,
        now: u64,
    ) {
        if let Some(session) = session {
            // The responder never saw our confirmation.
            if session.role() == Role::Initiator {
                trace!(peer = %remote, "resending confirmation");
                for fragment in session.confirmation() {
                    self.send_packet(remote, None, &Packet::SessionConfirmed(fragment.clone()));
                }
            }
            return;
        }
        let Some(Handshake::Outbound(h)) = self.establishment.get(&remote) else {
            trace!(peer = %remote, "session created without an initiator handshake");
            return;
        };
        let result = lock(&h).receive_session_created(created, self.crypto.as_ref(), now);
        match result {
            Ok(()) => self.drive_outbound(remote, &h, now),
            Err(e) => self.on_handshake_error(remote, e),
        }
    }

    // ─── Handshake outcomes ─────────────────────────────────────────────

    fn on_handshake_error(&self, remote: RemoteHostId, error: HandshakeError) {
        match error {
            HandshakeError::Failed(reason) => self.abandon_handshake(remote, reason),
            HandshakeError::Crypto(e) => {
                warn!(peer = %remote, error = %e, "crypto failure during handshake");
                self.abandon_handshake(remote, FailureReason::KeyAgreement);
            }
            other => debug!(peer = %remote, error = %other, "handshake packet ignored"),
        }
    }

    fn abandon_handshake(&self, remote: RemoteHostId, reason: FailureReason) {
        if let Some(abandoned) = self.establishment.fail(&remote, reason) {
            self.report_abandoned(abandoned);
        }
    }

    fn report_abandoned(&self, abandoned: AbandonedHandshake) {
        let AbandonedHandshake {
            remote,
            reason,
            queued,
        } = abandoned;
        warn!(peer = %remote, %reason, queued = queued.len(), "handshake failed");
        self.fail_messages(remote, queued, MessageFailure::Handshake(reason.clone()));
        self.emit(NodeEvent::HandshakeFailed {
            peer: remote.socket_addr(),
            reason,
        });
    }

    fn fail_messages(&self, remote: RemoteHostId, queued: Vec<QueuedMessage>, failure: MessageFailure) {
        for msg in queued {
            self.emit(NodeEvent::MessageFailed {
                peer: remote.socket_addr(),
                handle: MessageHandle(msg.handle),
                failure: failure.clone(),
            });
        }
    }

    /// Publish the session. Called with the completed handshake still locked
    /// so a concurrent submit sees either the handshake or the session.
    fn install_session(&self, mut established: EstablishedSession) -> Promotion {
        let queued = std::mem::take(&mut established.queued);
        let session = Arc::new(PeerSession::new(
            established,
            self.pool.clone(),
            self.config.reassembly.clone(),
            self.config.outbound.clone(),
        ));
        let replaced = lock(&self.peers).insert(session.remote(), session.clone());
        Promotion {
            session,
            queued,
            replaced,
        }
    }

    fn finish_promotion(&self, promotion: Promotion, now: u64) {
        let Promotion {
            session,
            queued,
            replaced,
        } = promotion;
        let remote = session.remote();
        self.establishment.complete(&remote);
        if let Some(old) = replaced {
            self.close_session(&old);
        }
        info!(
            peer = %remote,
            peer_id = %session.peer_id(),
            role = ?session.role(),
            queued = queued.len(),
            "session established"
        );
        self.emit(NodeEvent::HandshakeComplete {
            peer: remote.socket_addr(),
            peer_id: session.peer_id(),
        });
        let had_queued = !queued.is_empty();
        for msg in queued {
            let handle = MessageHandle(msg.handle);
            if let Err(e) = self.queue_on_session(&session, handle, msg.payload, now) {
                self.emit(NodeEvent::MessageFailed {
                    peer: remote.socket_addr(),
                    handle,
                    failure: MessageFailure::Rejected(e),
                });
            }
        }
        if had_queued {
            self.wake();
        }
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    fn queue_on_session(
        &self,
        session: &PeerSession,
        handle: MessageHandle,
        payload: Bytes,
        now: u64,
    ) -> Result<(), OutboundError> {
        let message_id = session.queue_message(payload, now)?;
        lock(&self.handles).insert((session.remote(), message_id), handle);
        trace!(peer = %session.remote(), message_id, handle = handle.0, "message queued");
        Ok(())
    }

    fn drop_session(&self, remote: &RemoteHostId, notify_peer: bool) -> bool {
        let Some(session) = lock(&self.peers).remove(remote) else {
            return false;
        };
        if notify_peer {
            self.send_packet(
                *remote,
                Some(session.keys()),
                &Packet::SessionDestroyed {
                    reason: DESTROY_REASON_CLOSED,
                },
            );
        }
        self.close_session(&session);
        true
    }

    fn close_session(&self, session: &PeerSession) {
        let remote = session.remote();
        self.acks.remove_peer(&remote);
        let pending = session.close();
        let failed: Vec<MessageHandle> = {
            let mut handles = lock(&self.handles);
            pending
                .iter()
                .filter_map(|id| handles.remove(&(remote, *id)))
                .collect()
        };
        info!(peer = %remote, unacked = failed.len(), "session closed");
        for handle in failed {
            self.emit(NodeEvent::MessageFailed {
                peer: remote.socket_addr(),
                handle,
                failure: MessageFailure::Closed,
            });
        }
        self.emit(NodeEvent::SessionClosed {
            peer: remote.socket_addr(),
        });
    }

    fn send_acks(&self, remote: &RemoteHostId, acks: Vec<AckBitfield>) {
        let Some(session) = self.peer(remote) else {
            return;
        };
        for chunk in acks.chunks(MAX_ACKS_PER_PACKET) {
            let packet = Packet::Data(DataPacket {
                acks: chunk.to_vec(),
                fragments: Vec::new(),
            });
            self.send_packet(*remote, Some(session.keys()), &packet);
        }
    }

    /// Pack frames into as few data packets as the MTU allows.
    fn send_fragments(&self, session: &PeerSession, frames: Vec<FragmentFrame>) {
        let max_packet = self.config.max_packet_size();
        let empty_len = HEADER_SIZE + DataPacket::default().encoded_len();
        let mut packet = DataPacket::default();
        let mut len = empty_len;
        for frame in frames {
            let frame_len = frame.encoded_len();
            if !packet.fragments.is_empty()
                && (len + frame_len > max_packet || packet.fragments.len() == MAX_WIRE_COUNT)
            {
                self.send_packet(
                    session.remote(),
                    Some(session.keys()),
                    &Packet::Data(std::mem::take(&mut packet)),
                );
                len = empty_len;
            }
            len += frame_len;
            packet.fragments.push(frame);
        }
        if !packet.fragments.is_empty() {
            self.send_packet(session.remote(), Some(session.keys()), &Packet::Data(packet));
        }
    }

    // ─── Pump ───────────────────────────────────────────────────────────

    fn service_handshakes(&self, now: u64) {
        let report = self.establishment.sweep(now);
        for abandoned in report.abandoned {
            self.report_abandoned(abandoned);
        }
        for (remote, h) in report.due {
            match h {
                Handshake::Inbound(h) => self.respond_inbound(remote, &h, now),
                Handshake::Outbound(h) => self.drive_outbound(remote, &h, now),
            }
        }
    }

    fn service_sessions(&self, now: u64) {
        let sessions: Vec<Arc<PeerSession>> = lock(&self.peers).values().cloned().collect();
        for session in sessions {
            let expired = session.expire_inbound(now);
            if !expired.is_empty() {
                debug!(peer = %session.remote(), count = expired.len(), "inbound messages expired");
            }

            let due = session.due_fragments(now);
            if !due.failed.is_empty() {
                let remote = session.remote();
                let failed: Vec<(MessageHandle, FailureCause)> = {
                    let mut handles = lock(&self.handles);
                    due.failed
                        .iter()
                        .filter_map(|f| handles.remove(&(remote, f.message_id)).map(|h| (h, f.cause)))
                        .collect()
                };
                for (handle, cause) in failed {
                    self.emit(NodeEvent::MessageFailed {
                        peer: remote.socket_addr(),
                        handle,
                        failure: MessageFailure::Delivery(cause),
                    });
                }
            }
            if !due.frames.is_empty() {
                self.send_fragments(&session, due.frames);
            }
        }
    }
}

fn recv_loop(shared: &Shared) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    debug!(addr = %shared.local_addr, "receive loop started");
    while shared.is_running() {
        match shared.socket.recv_from(&mut buf) {
            Ok((len, from)) => shared.handle_datagram(&buf[..len], from),
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                warn!(error = %e, "receive failed");
                thread::sleep(Duration::from_millis(PUMP_INTERVAL_MS));
            }
        }
    }
    debug!("receive loop stopped");
}

fn pump_loop(shared: &Shared) {
    debug!("pump started");
    while shared.is_running() {
        let now = shared.now();
        shared.service_handshakes(now);
        shared.service_sessions(now);
        match shared
            .wake_rx
            .recv_timeout(Duration::from_millis(PUMP_INTERVAL_MS))
        {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("pump stopped");
}

// ─── Endpoint ───────────────────────────────────────────────────────────────

/// A running node. Dropping it closes every session and joins its threads.
pub struct Endpoint {
    shared: Arc<Shared>,
    events: Receiver<NodeEvent>,
    acks: Option<AckSender<RemoteHostId>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Endpoint {
    /// Bind a UDP socket at `config.bind` and start the node.
    pub fn bind(config: NodeConfig, crypto: Arc<dyn CryptoService>) -> Result<Self> {
        let socket = bind_udp(config.bind).with_context(|| format!("binding {}", config.bind))?;
        Self::with_socket(config, Arc::new(socket), crypto, Arc::new(MonotonicClock::new()))
    }

    /// Start the node on an existing socket and clock.
    pub fn with_socket(
        config: NodeConfig,
        socket: Arc<dyn DatagramSocket>,
        crypto: Arc<dyn CryptoService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (events_tx, events) = unbounded::<NodeEvent>();
        Self::start(config, socket, crypto, clock, events, move |event: NodeEvent| {
            let _ = events_tx.send(event);
        })
    }

    /// Start the node with `handler` running every event on the delivery
    /// thread instead of [`Endpoint::events`], which then stays empty.
    ///
    /// A message completed while the delivery queue is full is not
    /// acknowledged; it is delivered once the sender retransmits it.
    pub fn with_handler<F>(
        config: NodeConfig,
        socket: Arc<dyn DatagramSocket>,
        crypto: Arc<dyn CryptoService>,
        clock: Arc<dyn Clock>,
        handler: F,
    ) -> Result<Self>
    where
        F: FnMut(NodeEvent) + Send + 'static,
    {
        let (_, events) = unbounded::<NodeEvent>();
        Self::start(config, socket, crypto, clock, events, handler)
    }

    fn start<F>(
        config: NodeConfig,
        socket: Arc<dyn DatagramSocket>,
        crypto: Arc<dyn CryptoService>,
        clock: Arc<dyn Clock>,
        events: Receiver<NodeEvent>,
        handler: F,
    ) -> Result<Self>
    where
        F: FnMut(NodeEvent) + Send + 'static,
    {
        let local_addr = socket.local_addr().context("reading local address")?;
        let delivery = MessageDelivery::spawn("skiff-delivery", config.delivery_capacity, handler)
            .context("spawning delivery worker")?;
        let (wake_tx, wake_rx) = bounded(1);

        let shared = Arc::new(Shared {
            establishment: EstablishmentManager::new(config.establish_config(local_addr.port())),
            pool: Arc::new(FragmentPool::new(config.pool.capacity, config.pool.buffer_size)),
            acks: Arc::new(AckScheduler::new(config.ack_interval_ms)),
            config,
            local_addr,
            socket,
            crypto,
            clock: clock.clone(),
            peers: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            delivery,
            wake_tx,
            wake_rx,
            running: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            send_errors: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        });

        let ack_shared = shared.clone();
        let acks = AckSender::spawn("skiff-acks", shared.acks.clone(), clock, move |peer, batch| {
            ack_shared.send_acks(peer, batch)
        })
        .context("spawning ack sender")?;

        let mut endpoint = Endpoint {
            shared,
            events,
            acks: Some(acks),
            workers: Vec::new(),
        };
        // On error the partially started endpoint is dropped and shut down.
        endpoint.spawn_worker("skiff-recv", recv_loop)?;
        endpoint.spawn_worker("skiff-pump", pump_loop)?;
        info!(addr = %local_addr, "endpoint started");
        Ok(endpoint)
    }

    fn spawn_worker(&mut self, name: &str, body: fn(&Shared)) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || body(&shared))
            .with_context(|| format!("spawning {name}"))?;
        self.workers.push(handle);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Completion, acknowledgment and handshake events, in order per thread
    /// that produced them.
    pub fn events(&self) -> &Receiver<NodeEvent> {
        &self.events
    }

    /// Record `identity` for `addr` and start a handshake unless one is
    /// already running or established.
    pub fn connect(&self, addr: SocketAddr, identity: Bytes) -> Result<()> {
        self.ensure_running()?;
        let remote = RemoteHostId::from(addr);
        lock(&self.shared.identities).insert(remote, identity);
        if self.shared.peer(&remote).is_some() || self.shared.establishment.get(&remote).is_some() {
            return Ok(());
        }
        self.shared.start_outbound(remote, None, self.shared.now())
    }

    /// Queue `payload` for `addr`. Before the session exists the message
    /// waits on the handshake, which is started if needed.
    pub fn submit_message(&self, addr: SocketAddr, payload: Bytes) -> Result<MessageHandle> {
        self.ensure_running()?;
        let remote = RemoteHostId::from(addr);
        let handle = MessageHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let now = self.shared.now();

        // A handshake that completes between the lookups is found as a
        // session on the second pass.
        for _ in 0..2 {
            if let Some(session) = self.shared.peer(&remote) {
                self.shared
                    .queue_on_session(&session, handle, payload, now)
                    .with_context(|| format!("queueing message for {addr}"))?;
                self.shared.wake();
                return Ok(handle);
            }
            let msg = QueuedMessage {
                handle: handle.0,
                payload: payload.clone(),
            };
            let queued = match self.shared.establishment.get(&remote) {
                Some(Handshake::Outbound(h)) => lock(&h).queue_message(msg),
                Some(Handshake::Inbound(h)) => lock(&h).queue_message(msg),
                None => {
                    self.shared.start_outbound(remote, Some(msg), now)?;
                    return Ok(handle);
                }
            };
            match queued {
                Ok(_) => return Ok(handle),
                Err(HandshakeError::AlreadyComplete) => continue,
                Err(e) => return Err(e).with_context(|| format!("queueing message for {addr}")),
            }
        }
        bail!("no session or handshake available for {addr}")
    }

    /// Close the session with `addr` (telling the peer) or abandon the
    /// handshake in progress. Returns whether there was anything to close.
    pub fn disconnect(&self, addr: SocketAddr) -> bool {
        let remote = RemoteHostId::from(addr);
        if self.shared.drop_session(&remote, true) {
            return true;
        }
        match self.shared.establishment.fail(&remote, FailureReason::Rejected) {
            Some(abandoned) => {
                self.shared.report_abandoned(abandoned);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.shared.peer(&RemoteHostId::from(addr)).is_some()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        lock(&self.shared.peers)
            .keys()
            .map(RemoteHostId::socket_addr)
            .collect()
    }

    pub fn peer_stats(&self, addr: SocketAddr) -> Option<PeerStats> {
        let session = self.shared.peer(&RemoteHostId::from(addr))?;
        let now = self.shared.now();
        Some(PeerStats {
            sender: session.sender_stats(),
            receiver: session.receiver_stats(),
            rtt_ms: session.rtt_ms(),
            rto_ms: session.rto_ms(),
            bandwidth: session.bandwidth_estimate(now),
            congestion_window: session.congestion_window(now),
            in_flight: session.outbound_in_flight(),
        })
    }

    pub fn stats(&self) -> NodeStats {
        let sessions: Vec<Arc<PeerSession>> = lock(&self.shared.peers).values().cloned().collect();
        let mut receiver = ReceiverStats::default();
        for session in &sessions {
            receiver.merge(&session.receiver_stats());
        }
        NodeStats {
            handshakes: self.shared.establishment.stats(),
            peers: sessions.len(),
            pool_available: self.shared.pool.available(),
            pool_exhausted: self.shared.pool.exhausted_count(),
            receiver,
            send_errors: self.shared.send_errors.load(Ordering::Relaxed),
            dropped_events: self.shared.dropped_events.load(Ordering::Relaxed),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.shared.is_running() {
            bail!("endpoint at {} is shut down", self.shared.local_addr);
        }
        Ok(())
    }

    /// Stop the worker threads and close every session. Idempotent.
    pub fn shutdown(&mut self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        self.shared.wake();
        if let Some(mut acks) = self.acks.take() {
            acks.shutdown();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        let remotes: Vec<RemoteHostId> = lock(&self.shared.peers).keys().copied().collect();
        for remote in remotes {
            self.shared.drop_session(&remote, true);
        }
        if was_running {
            info!(addr = %self.shared.local_addr, "endpoint stopped");
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.shared.local_addr)
            .field("peers", &lock(&self.shared.peers).len())
            .field("handshakes", &self.shared.establishment.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Event Tests ────────────────────────────────────────────────────

    #[test]
    fn event_kinds_are_distinct() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let events = [
            NodeEvent::HandshakeComplete {
                peer,
                peer_id: PeerId([0; 32]),
            },
            NodeEvent::HandshakeFailed {
                peer,
                reason: FailureReason::Timeout,
            },
            NodeEvent::MessageComplete {
                peer,
                message_id: 1,
                payload: Bytes::new(),
            },
            NodeEvent::MessageAcked {
                peer,
                handle: MessageHandle(1),
            },
            NodeEvent::MessageFailed {
                peer,
                handle: MessageHandle(1),
                failure: MessageFailure::Closed,
            },
            NodeEvent::SessionClosed { peer },
        ];
        let mut kinds: Vec<&str> = events.iter().map(NodeEvent::kind).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), events.len());
    }

    #[test]
    fn failure_display() {
        assert_eq!(
            MessageFailure::Handshake(FailureReason::Timeout).to_string(),
            "handshake failed: timed out"
        );
        assert_eq!(MessageFailure::Delivery(FailureCause::Expired).to_string(), "expired");
        assert_eq!(MessageFailure::Closed.to_string(), "session closed");
    }

    #[test]
    fn stats_serialize() {
        let json = serde_json::to_value(NodeStats::default()).unwrap();
        assert_eq!(json["peers"], 0);
        assert!(json["handshakes"].is_object());
    }
}
