//! # Peer Sessions
//!
//! State kept for a peer after its handshake completes: the negotiated keys,
//! the inbound reassembly table, the outbound message table, RTT tracking
//! and the bandwidth estimate.
//!
//! Each part sits behind its own lock so the receive path, the pump and the
//! ACK sender rarely contend. Lock order inside a session: `outbound` before
//! `rtt`; `inbound` is never held together with another.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::ack::AckBitfield;
use crate::bandwidth::BandwidthEstimator;
use crate::crypto::{PeerId, SessionKeys};
use crate::handshake::{EstablishedSession, RemoteHostId, Role};
use crate::outbound::{DueFragments, OutboundConfig, OutboundError, OutboundMessages};
use crate::pool::FragmentPool;
use crate::reassembly::{
    CompletedMessage, InboundMessages, ReassemblyConfig, ReassemblyError, Received,
};
use crate::rtt::RttTracker;
use crate::stats::{ReceiverStats, SenderStats};
use crate::wire::{FragmentFrame, SessionConfirmed};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result of applying one batch of peer ACKs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckSummary {
    /// Messages that became fully acknowledged.
    pub completed: Vec<u32>,
    pub acked_bytes: u64,
}

pub struct PeerSession {
    remote: RemoteHostId,
    peer_id: PeerId,
    keys: SessionKeys,
    role: Role,
    established_ms: u64,
    fragment_size: usize,
    /// Initiator only: resent if the responder repeats SessionCreated.
    confirmation: Vec<SessionConfirmed>,
    inbound: Mutex<InboundMessages>,
    outbound: Mutex<OutboundMessages>,
    rtt: Mutex<RttTracker>,
    bandwidth: BandwidthEstimator,
}

impl PeerSession {
    pub fn new(
        established: EstablishedSession,
        pool: Arc<FragmentPool>,
        reassembly: ReassemblyConfig,
        outbound: OutboundConfig,
    ) -> Self {
        let now = established.established_ms;
        PeerSession {
            remote: established.remote,
            peer_id: established.peer_id,
            keys: established.keys,
            role: established.role,
            established_ms: now,
            fragment_size: outbound.fragment_size,
            confirmation: established.confirmation,
            inbound: Mutex::new(InboundMessages::new(pool, reassembly)),
            outbound: Mutex::new(OutboundMessages::new(outbound)),
            rtt: Mutex::new(RttTracker::new()),
            bandwidth: BandwidthEstimator::new(now),
        }
    }

    pub fn remote(&self) -> RemoteHostId {
        self.remote
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn established_ms(&self) -> u64 {
        self.established_ms
    }

    pub fn confirmation(&self) -> &[SessionConfirmed] {
        &self.confirmation
    }

    // ─── Receive path ───────────────────────────────────────────────────

    pub fn receive_fragment(
        &self,
        frame: &FragmentFrame,
        now_ms: u64,
    ) -> Result<Received, ReassemblyError> {
        lock(&self.inbound).receive(frame, now_ms)
    }

    /// Hold a completion the application could not take; see
    /// [`InboundMessages::hold`].
    pub fn hold_undelivered(&self, message: CompletedMessage) -> bool {
        lock(&self.inbound).hold(message)
    }

    /// Drop stalled inbound messages.
    pub fn expire_inbound(&self, now_ms: u64) -> Vec<u32> {
        lock(&self.inbound).expire(now_ms)
    }

    pub fn receiver_stats(&self) -> ReceiverStats {
        lock(&self.inbound).stats().clone()
    }

    // ─── Send path ──────────────────────────────────────────────────────

    pub fn queue_message(&self, payload: Bytes, now_ms: u64) -> Result<u32, OutboundError> {
        lock(&self.outbound).queue(payload, now_ms)
    }

    /// Fragments to send now, limited by the congestion window.
    pub fn due_fragments(&self, now_ms: u64) -> DueFragments {
        let window = self.congestion_window(now_ms);
        let mut outbound = lock(&self.outbound);
        let rto = lock(&self.rtt).rto_ms();
        let due = outbound.due_fragments_within(now_ms, rto, window);
        if due.retransmitted > 0 {
            trace!(peer = %self.remote, frames = due.retransmitted, "retransmitting");
        }
        due
    }

    /// Apply ACKs received from the peer and feed the estimators.
    pub fn on_acks(&self, acks: &[AckBitfield], now_ms: u64) -> AckSummary {
        let mut summary = AckSummary::default();
        {
            let mut outbound = lock(&self.outbound);
            for ack in acks {
                let Some(outcome) = outbound.apply_ack(ack, now_ms) else {
                    continue;
                };
                summary.acked_bytes += outcome.acked_bytes;
                if outcome.completed {
                    summary.completed.push(outcome.message_id);
                }
                if let Some(sample) = outcome.rtt_sample_ms {
                    lock(&self.rtt).on_sample(sample);
                }
            }
        }
        if summary.acked_bytes > 0 {
            let rtt = self.rtt_ms();
            self.bandwidth.add_sample(summary.acked_bytes, now_ms, rtt);
        }
        summary
    }

    pub fn sender_stats(&self) -> SenderStats {
        lock(&self.outbound).stats().clone()
    }

    pub fn outbound_in_flight(&self) -> usize {
        lock(&self.outbound).in_flight()
    }

    // ─── Estimates ──────────────────────────────────────────────────────

    /// Smoothed RTT, or the initial RTO before any sample.
    pub fn rtt_ms(&self) -> u64 {
        let rtt = lock(&self.rtt);
        if rtt.sample_count() == 0 {
            rtt.rto_ms()
        } else {
            rtt.rtt_ms()
        }
    }

    pub fn rto_ms(&self) -> u64 {
        lock(&self.rtt).rto_ms()
    }

    /// Bytes per millisecond.
    pub fn bandwidth_estimate(&self, now_ms: u64) -> f64 {
        self.bandwidth.bandwidth_estimate(now_ms, self.rtt_ms())
    }

    /// Bytes allowed in flight: `max(bwe · rtt, 2 · fragment_size)`.
    pub fn congestion_window(&self, now_ms: u64) -> usize {
        let rtt = self.rtt_ms();
        let bdp = self.bandwidth.bandwidth_estimate(now_ms, rtt) * rtt as f64;
        (bdp as usize).max(2 * self.fragment_size)
    }

    /// Release every buffer and return the ids of unacknowledged messages.
    pub fn close(&self) -> Vec<u32> {
        let buffers = lock(&self.inbound).clear();
        let pending = lock(&self.outbound).clear();
        debug!(peer = %self.remote, buffers, unacked = pending.len(), "session closed");
        pending
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote)
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("bandwidth", &self.bandwidth)
            .finish()
    }
}
