//! # Outbound Messages
//!
//! Pure logic, no I/O. Splits application messages into fragments, keeps
//! them in a slab until every fragment is acknowledged, and decides when
//! unacknowledged fragments go out again.
//!
//! ```text
//!   queue ──► slab slot ──due_fragments──► frames ──► socket
//!                 ▲                                      │
//!                 └──────────── apply_ack ◄──── peer ACK ┘
//! ```
//!
//! The first retransmission waits one RTO, later ones two (never more than
//! [`MAX_RETRANSMIT_INTERVAL_MS`]). A message fails once it has been sent
//! [`MAX_SENDS`] times or stays unacknowledged for [`MESSAGE_LIFETIME_MS`].
//!
//! The byte budget passed to [`OutboundMessages::due_fragments_within`]
//! covers everything in flight: fragments sent and not yet acknowledged
//! or due again count against it before anything new goes out.

use std::collections::HashMap;

use bytes::Bytes;
use rand::RngExt as _;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::ack::AckBitfield;
use crate::reassembly::MAX_FRAGMENTS;
use crate::stats::SenderStats;
use crate::wire::{FragmentFrame, MAX_FRAGMENT_PAYLOAD};

pub const DEFAULT_FRAGMENT_SIZE: usize = 1_024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;
pub const MAX_SENDS: u8 = 5;
pub const MESSAGE_LIFETIME_MS: u64 = 10_000;
pub const MAX_RETRANSMIT_INTERVAL_MS: u64 = 60_000;
/// Retransmit intervals grow to at most `rto << MAX_BACKOFF_SHIFT`.
const MAX_BACKOFF_SHIFT: u32 = 1;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Payload bytes per fragment.
    pub fragment_size: usize,
    /// Messages tracked at once.
    pub max_in_flight: usize,
    pub max_sends: u8,
    pub lifetime_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        OutboundConfig {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_sends: MAX_SENDS,
            lifetime_ms: MESSAGE_LIFETIME_MS,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboundError {
    #[error("empty message")]
    Empty,
    #[error("message of {len} bytes needs more than {max} fragments")]
    TooLarge { len: usize, max: usize },
    #[error("{0} messages already in flight")]
    Full(usize),
}

// ─── Message entry ──────────────────────────────────────────────────────────

/// Handle to a message slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageSlot(pub usize);

#[derive(Debug, Clone)]
struct OutboundMessage {
    message_id: u32,
    fragments: Vec<Bytes>,
    /// Bit i set once fragment i is acknowledged.
    acked: u32,
    sends: u8,
    queued_ms: u64,
    first_sent_ms: Option<u64>,
    next_send_ms: u64,
    /// Insertion order; the slab reuses keys.
    seq: u64,
}

impl OutboundMessage {
    fn all_acked_mask(&self) -> u32 {
        if self.fragments.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.fragments.len()) - 1
        }
    }

    fn is_complete(&self) -> bool {
        self.acked == self.all_acked_mask()
    }

    fn unacked_bytes(&self) -> usize {
        self.fragments
            .iter()
            .enumerate()
            .filter(|(i, _)| self.acked & (1 << i) == 0)
            .map(|(_, f)| f.len())
            .sum()
    }

    fn unacked_frames(&self) -> impl Iterator<Item = FragmentFrame> + '_ {
        let last = self.fragments.len() - 1;
        self.fragments
            .iter()
            .enumerate()
            .filter(|(i, _)| self.acked & (1 << i) == 0)
            .map(move |(i, payload)| FragmentFrame {
                message_id: self.message_id,
                index: i as u8,
                is_last: i == last,
                payload: payload.clone(),
            })
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Sent `max_sends` times without a full ACK.
    TooManySends,
    /// Unacknowledged for longer than the message lifetime.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    pub message_id: u32,
    pub cause: FailureCause,
}

/// Fragments to put on the wire now.
#[derive(Debug, Default)]
pub struct DueFragments {
    pub frames: Vec<FragmentFrame>,
    /// Frames in `frames` that are retransmissions.
    pub retransmitted: usize,
    pub failed: Vec<FailedMessage>,
    /// Earliest scheduled send among messages still waiting.
    pub next_due_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub message_id: u32,
    /// Payload bytes this ACK covered for the first time.
    pub acked_bytes: u64,
    pub completed: bool,
    /// Round trip of a message that completed after a single send.
    pub rtt_sample_ms: Option<u64>,
}

// ─── OutboundMessages ───────────────────────────────────────────────────────

pub struct OutboundMessages {
    config: OutboundConfig,
    entries: Slab<OutboundMessage>,
    by_id: HashMap<u32, MessageSlot>,
    next_seq: u64,
    stats: SenderStats,
}

impl OutboundMessages {
    pub fn new(config: OutboundConfig) -> Self {
        let entries = Slab::with_capacity(config.max_in_flight);
        OutboundMessages {
            config,
            entries,
            by_id: HashMap::new(),
            next_seq: 0,
            stats: SenderStats::default(),
        }
    }

    pub fn config(&self) -> &OutboundConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, message_id: u32) -> bool {
        self.by_id.contains_key(&message_id)
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Payload bytes not yet acknowledged across all messages.
    pub fn unacked_bytes(&self) -> usize {
        self.entries.iter().map(|(_, m)| m.unacked_bytes()).sum()
    }

    fn fresh_id(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let id: u32 = rng.random();
            if id != 0 && !self.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Split `payload` into fragments and start tracking it. Returns the
    /// message id, due for its first send immediately.
    pub fn queue(&mut self, payload: Bytes, now_ms: u64) -> Result<u32, OutboundError> {
        if payload.is_empty() {
            return Err(OutboundError::Empty);
        }
        let size = self.config.fragment_size.clamp(1, MAX_FRAGMENT_PAYLOAD);
        let count = payload.len().div_ceil(size);
        if count > MAX_FRAGMENTS {
            return Err(OutboundError::TooLarge {
                len: payload.len(),
                max: MAX_FRAGMENTS,
            });
        }
        if self.entries.len() >= self.config.max_in_flight {
            return Err(OutboundError::Full(self.entries.len()));
        }

        let fragments: Vec<Bytes> = (0..count)
            .map(|i| payload.slice(i * size..((i + 1) * size).min(payload.len())))
            .collect();
        let message_id = self.fresh_id();
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.entries.insert(OutboundMessage {
            message_id,
            fragments,
            acked: 0,
            sends: 0,
            queued_ms: now_ms,
            first_sent_ms: None,
            next_send_ms: now_ms,
            seq,
        });
        self.by_id.insert(message_id, MessageSlot(key));
        self.stats.messages_queued += 1;
        trace!(message_id, fragments = count, "message queued");
        Ok(message_id)
    }

    fn remove(&mut self, slot: MessageSlot) -> Option<OutboundMessage> {
        let msg = self.entries.try_remove(slot.0)?;
        self.by_id.remove(&msg.message_id);
        Some(msg)
    }

    /// Everything due at `now_ms`, without a byte budget.
    pub fn due_fragments(&mut self, now_ms: u64, rto_ms: u64) -> DueFragments {
        self.due_fragments_within(now_ms, rto_ms, usize::MAX)
    }

    /// Unacknowledged fragments of every message whose send time has come,
    /// oldest message first. `budget_bytes` bounds the bytes in flight:
    /// messages sent earlier and not yet due again are charged first, and
    /// due messages wait once the budget is used up. With nothing in
    /// flight the first due message always goes out.
    pub fn due_fragments_within(
        &mut self,
        now_ms: u64,
        rto_ms: u64,
        budget_bytes: usize,
    ) -> DueFragments {
        let mut due = DueFragments::default();
        let mut order: Vec<(u64, usize)> = self.entries.iter().map(|(k, m)| (m.seq, k)).collect();
        order.sort_unstable();

        // A message past its retransmit time is presumed lost.
        let mut spent: usize = self
            .entries
            .iter()
            .filter(|(_, m)| m.sends > 0 && m.next_send_ms > now_ms)
            .map(|(_, m)| m.unacked_bytes())
            .sum();
        for (_, key) in order {
            let Some(msg) = self.entries.get_mut(key) else {
                continue;
            };
            if now_ms.saturating_sub(msg.queued_ms) > self.config.lifetime_ms {
                due.failed.push(FailedMessage {
                    message_id: msg.message_id,
                    cause: FailureCause::Expired,
                });
                continue;
            }
            if msg.next_send_ms > now_ms {
                due.next_due_ms = Some(due.next_due_ms.map_or(msg.next_send_ms, |t| t.min(msg.next_send_ms)));
                continue;
            }
            if msg.sends >= self.config.max_sends {
                due.failed.push(FailedMessage {
                    message_id: msg.message_id,
                    cause: FailureCause::TooManySends,
                });
                continue;
            }
            let bytes = msg.unacked_bytes();
            if spent > 0 && spent.saturating_add(bytes) > budget_bytes {
                due.next_due_ms = Some(now_ms);
                continue;
            }
            spent += bytes;

            let retransmit = msg.sends > 0;
            let before = due.frames.len();
            due.frames.extend(msg.unacked_frames());
            let sent = due.frames.len() - before;
            if retransmit {
                due.retransmitted += sent;
                self.stats.fragments_retransmitted += sent as u64;
            }
            self.stats.fragments_sent += sent as u64;

            msg.sends += 1;
            msg.first_sent_ms.get_or_insert(now_ms);
            let shift = u32::from(msg.sends - 1).min(MAX_BACKOFF_SHIFT);
            let interval = rto_ms.saturating_mul(1 << shift).min(MAX_RETRANSMIT_INTERVAL_MS);
            msg.next_send_ms = now_ms + interval;
            due.next_due_ms = Some(due.next_due_ms.map_or(msg.next_send_ms, |t| t.min(msg.next_send_ms)));
        }

        for failed in &due.failed {
            if let Some(slot) = self.by_id.get(&failed.message_id).copied() {
                self.remove(slot);
                self.stats.messages_failed += 1;
                debug!(message_id = failed.message_id, cause = ?failed.cause, "message failed");
            }
        }
        due
    }

    /// Apply a peer's ACK. `None` if the message is no longer tracked.
    pub fn apply_ack(&mut self, ack: &AckBitfield, now_ms: u64) -> Option<AckOutcome> {
        let Some(slot) = self.by_id.get(&ack.message_id()).copied() else {
            self.stats.unknown_acks += 1;
            return None;
        };
        let msg = self.entries.get_mut(slot.0)?;

        let mut acked_bytes = 0u64;
        for (i, fragment) in msg.fragments.iter().enumerate() {
            let bit = 1u32 << i;
            if msg.acked & bit == 0 && ack.received(i) {
                msg.acked |= bit;
                acked_bytes += fragment.len() as u64;
            }
        }
        self.stats.bytes_acked += acked_bytes;

        let completed = msg.is_complete();
        let rtt_sample_ms = match (completed, msg.sends, msg.first_sent_ms) {
            (true, 1, Some(sent)) => Some(now_ms.saturating_sub(sent)),
            _ => None,
        };
        let message_id = msg.message_id;
        if completed {
            self.remove(slot);
            self.stats.messages_acked += 1;
            trace!(message_id, "message fully acknowledged");
        }
        Some(AckOutcome {
            message_id,
            acked_bytes,
            completed,
            rtt_sample_ms,
        })
    }

    /// Drop every tracked message, returning their ids.
    pub fn clear(&mut self) -> Vec<u32> {
        let ids: Vec<u32> = self.entries.drain().map(|m| m.message_id).collect();
        self.by_id.clear();
        ids
    }
}

impl Default for OutboundMessages {
    fn default() -> Self {
        Self::new(OutboundConfig::default())
    }
}

impl std::fmt::Debug for OutboundMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundMessages")
            .field("in_flight", &self.entries.len())
            .field("unacked_bytes", &self.unacked_bytes())
            .finish()
    }
}
