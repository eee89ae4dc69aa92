//! # Acknowledgments
//!
//! - [`AckBitfield`] — immutable record of which fragments of one message
//!   were received.
//! - [`AckTracker`] — per-peer FIFO of bitfields waiting to be sent.
//! - [`AckScheduler`] — picks, across all peers, the next peer whose ACKs
//!   should go out: oldest pending first, never more often than the minimum
//!   interval per peer.
//!
//! ```text
//!  InboundMessages ──add_pending──► AckScheduler ──poll──► AckSender loop ──► socket
//!                                     │  per peer:
//!                                     └─ Arc<Mutex<AckTracker>>
//! ```

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::reassembly::MAX_FRAGMENTS;
use crate::wire::MAX_WIRE_COUNT;

/// Minimum time between two ACK transmissions to the same peer.
pub const ACK_FREQUENCY_MS: u64 = 150;

/// Upper bound on how long an idle worker sleeps before re-checking shutdown.
pub const IDLE_RECHECK_MS: u64 = 1_000;

// ─── AckBitfield ─────────────────────────────────────────────────────────────

/// Snapshot of the receive state of one message.
///
/// `FullyReceived` acks decoded off the wire carry a fragment count of 0;
/// `received(i)` is true for every index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckBitfield {
    Partial {
        message_id: u32,
        fragment_count: u8,
        mask: u64,
    },
    FullyReceived {
        message_id: u32,
        fragment_count: u8,
    },
}

impl AckBitfield {
    /// Bits at or above `fragment_count` are cleared.
    pub fn partial(message_id: u32, fragment_count: u8, mask: u64) -> Self {
        let mask = if fragment_count as u32 >= u64::BITS {
            mask
        } else {
            mask & ((1u64 << fragment_count) - 1)
        };
        AckBitfield::Partial {
            message_id,
            fragment_count,
            mask,
        }
    }

    pub fn fully_received(message_id: u32, fragment_count: u8) -> Self {
        AckBitfield::FullyReceived {
            message_id,
            fragment_count,
        }
    }

    pub fn message_id(&self) -> u32 {
        match *self {
            AckBitfield::Partial { message_id, .. } => message_id,
            AckBitfield::FullyReceived { message_id, .. } => message_id,
        }
    }

    pub fn fragment_count(&self) -> u8 {
        match *self {
            AckBitfield::Partial { fragment_count, .. } => fragment_count,
            AckBitfield::FullyReceived { fragment_count, .. } => fragment_count,
        }
    }

    pub fn received(&self, index: usize) -> bool {
        match *self {
            AckBitfield::Partial {
                fragment_count,
                mask,
                ..
            } => index < fragment_count as usize && index < 64 && mask & (1u64 << index) != 0,
            AckBitfield::FullyReceived { .. } => true,
        }
    }

    pub fn received_complete(&self) -> bool {
        match *self {
            AckBitfield::Partial {
                fragment_count,
                mask,
                ..
            } => {
                fragment_count > 0
                    && (0..fragment_count as usize).all(|i| i < 64 && mask & (1u64 << i) != 0)
            }
            AckBitfield::FullyReceived { .. } => true,
        }
    }

    /// Bit `i` set iff fragment `i` was received, limited to what fits the
    /// fragment table.
    pub fn mask(&self) -> u64 {
        match *self {
            AckBitfield::Partial { mask, .. } => mask,
            AckBitfield::FullyReceived { fragment_count, .. } => {
                let count = if fragment_count == 0 {
                    MAX_FRAGMENTS
                } else {
                    fragment_count as usize
                };
                if count >= 64 {
                    u64::MAX
                } else {
                    (1u64 << count) - 1
                }
            }
        }
    }
}

// ─── AckTracker ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingAck {
    ack: AckBitfield,
    queued_at_ms: u64,
}

/// Bitfields owed to a single peer, oldest first.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: VecDeque<PendingAck>,
    last_sent_ms: Option<u64>,
    acks_sent: u64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a bitfield. A newer bitfield for a message already queued
    /// replaces it without losing its place in line.
    pub fn add_pending(&mut self, ack: AckBitfield, now_ms: u64) {
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|p| p.ack.message_id() == ack.message_id())
        {
            existing.ack = ack;
            return;
        }
        self.pending.push_back(PendingAck {
            ack,
            queued_at_ms: now_ms,
        });
    }

    /// Remove up to 255 bitfields in FIFO order and mark the peer as acked.
    pub fn drain_pending(&mut self, now_ms: u64) -> Vec<AckBitfield> {
        let take = self.pending.len().min(MAX_WIRE_COUNT);
        let batch: Vec<AckBitfield> = self.pending.drain(..take).map(|p| p.ack).collect();
        if !batch.is_empty() {
            self.last_sent_ms = Some(now_ms);
            self.acks_sent += batch.len() as u64;
        }
        batch
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Arrival time of the oldest queued bitfield.
    pub fn oldest_pending_ms(&self) -> Option<u64> {
        self.pending.front().map(|p| p.queued_at_ms)
    }

    pub fn last_sent_ms(&self) -> Option<u64> {
        self.last_sent_ms
    }

    /// Earliest time the next batch may go out.
    pub fn eligible_at(&self, min_interval_ms: u64) -> u64 {
        self.last_sent_ms
            .map(|t| t.saturating_add(min_interval_ms))
            .unwrap_or(0)
    }

    pub fn acks_sent(&self) -> u64 {
        self.acks_sent
    }
}

// ─── AckScheduler ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPoll<K> {
    /// Send this batch to this peer now.
    Ready(K, Vec<AckBitfield>),
    /// Nothing is eligible. `Some(ms)` until the earliest peer becomes
    /// eligible, `None` if nothing is pending at all.
    Wait(Option<u64>),
}

/// Cross-peer ACK scheduling with a doorbell for the sender loop.
pub struct AckScheduler<K> {
    trackers: Mutex<HashMap<K, Arc<Mutex<AckTracker>>>>,
    min_interval_ms: u64,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    running: AtomicBool,
}

impl<K: Clone + Eq + Hash> AckScheduler<K> {
    pub fn new(min_interval_ms: u64) -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        AckScheduler {
            trackers: Mutex::new(HashMap::new()),
            min_interval_ms,
            doorbell_tx,
            doorbell_rx,
            running: AtomicBool::new(true),
        }
    }

    pub fn min_interval_ms(&self) -> u64 {
        self.min_interval_ms
    }

    fn tracker(&self, peer: &K) -> Arc<Mutex<AckTracker>> {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AckTracker::new())))
            .clone()
    }

    /// Queue a bitfield for `peer` and wake the sender loop.
    pub fn add_pending(&self, peer: &K, ack: AckBitfield, now_ms: u64) {
        let tracker = self.tracker(peer);
        tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_pending(ack, now_ms);
        self.notify();
    }

    /// Forget a peer and anything still queued for it.
    pub fn remove_peer(&self, peer: &K) -> usize {
        let removed = self
            .trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
        removed
            .map(|t| t.lock().unwrap_or_else(|e| e.into_inner()).pending_len())
            .unwrap_or(0)
    }

    pub fn pending_len(&self, peer: &K) -> usize {
        let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers
            .get(peer)
            .map(|t| t.lock().unwrap_or_else(|e| e.into_inner()).pending_len())
            .unwrap_or(0)
    }

    /// Choose the next peer to acknowledge and drain its batch.
    pub fn poll(&self, now_ms: u64) -> AckPoll<K> {
        let candidates: Vec<(K, Arc<Mutex<AckTracker>>)> = {
            let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            trackers
                .iter()
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect()
        };

        let mut best: Option<(u64, K, Arc<Mutex<AckTracker>>)> = None;
        let mut next_eligible: Option<u64> = None;
        for (peer, tracker) in candidates {
            let guard = tracker.lock().unwrap_or_else(|e| e.into_inner());
            let Some(oldest) = guard.oldest_pending_ms() else {
                continue;
            };
            let eligible_at = guard.eligible_at(self.min_interval_ms);
            drop(guard);
            if eligible_at > now_ms {
                next_eligible = Some(next_eligible.map_or(eligible_at, |n| n.min(eligible_at)));
                continue;
            }
            if best.as_ref().map_or(true, |(t, _, _)| oldest < *t) {
                best = Some((oldest, peer, tracker));
            }
        }

        if let Some((_, peer, tracker)) = best {
            let batch = tracker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain_pending(now_ms);
            if !batch.is_empty() {
                return AckPoll::Ready(peer, batch);
            }
        }
        AckPoll::Wait(next_eligible.map(|t| t.saturating_sub(now_ms)))
    }
}

impl<K> AckScheduler<K> {
    /// Ring the doorbell. Never blocks.
    pub fn notify(&self) {
        let _ = self.doorbell_tx.try_send(());
    }

    /// Block until notified or `timeout` elapses. Returns true if notified.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.doorbell_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the sender loop at its next wake.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.notify();
    }
}
