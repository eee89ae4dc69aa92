//! # Transport Statistics
//!
//! Counters kept by the receive path, the send path and the establishment
//! manager. All of them serialize to JSON for the node's stats snapshot.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Per-peer send-side counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Messages accepted by `queue`.
    pub messages_queued: u64,
    /// Messages whose every fragment was acknowledged.
    pub messages_acked: u64,
    /// Messages abandoned after too many sends or too long unacked.
    pub messages_failed: u64,
    /// Fragment transmissions, first sends and retransmissions.
    pub fragments_sent: u64,
    /// Fragment transmissions after the first.
    pub fragments_retransmitted: u64,
    /// Payload bytes newly acknowledged.
    pub bytes_acked: u64,
    /// ACKs naming a message we no longer track.
    pub unknown_acks: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of fragment sends that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.fragments_sent == 0 {
            0.0
        } else {
            self.fragments_retransmitted as f64 / self.fragments_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Per-peer receive-side counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Fragments handed to the reassembler, duplicates included.
    pub fragments_received: u64,
    pub duplicate_fragments: u64,
    /// Fragments rejected as malformed.
    pub corrupt_fragments: u64,
    /// Fragments dropped because no buffer was free.
    pub pool_exhausted: u64,
    /// New messages refused because too many were in flight.
    pub rejected_messages: u64,
    pub messages_completed: u64,
    /// Completions the application could not take yet, held for a retry.
    pub messages_deferred: u64,
    pub messages_expired: u64,
    pub bytes_delivered: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of received fragments that were duplicates.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.fragments_received == 0 {
            0.0
        } else {
            self.duplicate_fragments as f64 / self.fragments_received as f64
        }
    }

    /// Add another peer's counters into this one.
    pub fn merge(&mut self, other: &ReceiverStats) {
        self.fragments_received += other.fragments_received;
        self.duplicate_fragments += other.duplicate_fragments;
        self.corrupt_fragments += other.corrupt_fragments;
        self.pool_exhausted += other.pool_exhausted;
        self.rejected_messages += other.rejected_messages;
        self.messages_completed += other.messages_completed;
        self.messages_deferred += other.messages_deferred;
        self.messages_expired += other.messages_expired;
        self.bytes_delivered += other.bytes_delivered;
    }
}

// ─── Handshake Stats ────────────────────────────────────────────────────────

/// Establishment counters across all peers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandshakeStats {
    pub inbound_started: u64,
    pub outbound_started: u64,
    pub completed: u64,
    /// Failures other than timeouts.
    pub failed: u64,
    pub timed_out: u64,
    /// New handshakes refused at the concurrency limit.
    pub rejected_at_capacity: u64,
    pub tokens_issued: u64,
    pub tokens_redeemed: u64,
    pub tokens_rejected: u64,
}

impl HandshakeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed handshakes over all that reached an outcome.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.timed_out;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }
}
