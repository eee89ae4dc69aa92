//! # Fragment Reassembly
//!
//! [`FragmentReassembler`] collects the fragments of one inbound message in a
//! fixed 32-slot table, in any order and with duplicates. [`InboundMessages`]
//! is the per-peer table of reassemblers: it routes frames by message id,
//! emits completed messages and the acknowledgment bitfield to send back, and
//! sweeps out messages that stall past the expiry window.
//!
//! ```text
//!   frame(id=7, idx=2) ─┐
//!   frame(id=7, idx=0) ─┼─► InboundMessages ─► reassembler[7]: [0][ ][2][ ][4*]
//!   frame(id=7, idx=4*)─┘                          * = last fragment
//! ```
//!
//! Every stored fragment holds a buffer from the shared [`FragmentPool`]. The
//! buffers go back when the message completes, expires, or the reassembler is
//! dropped.

use std::cell::OnceCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ack::AckBitfield;
use crate::pool::{FragmentBuffer, FragmentPool, PoolError};
use crate::stats::ReceiverStats;
use crate::wire::FragmentFrame;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Fragment table size. Indices at or above this are corrupt.
pub const MAX_FRAGMENTS: usize = 32;

/// A message not completed this long after its first fragment is abandoned.
pub const MESSAGE_EXPIRY_MS: u64 = 10_000;

/// Ids of delivered messages remembered for duplicate suppression.
pub const RECENTLY_COMPLETED_CAPACITY: usize = 1024;

/// Concurrent partially received messages per peer.
pub const MAX_INBOUND_MESSAGES: usize = 256;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("corrupt fragment {index} of message {message_id}: {reason}")]
    CorruptFragment {
        message_id: u32,
        index: u8,
        reason: &'static str,
    },
    #[error("fragment pool exhausted")]
    PoolExhausted,
    #[error("message {0} already released")]
    Released(u32),
    #[error("too many partially received messages ({0})")]
    TooManyMessages(usize),
}

// ─── FragmentReassembler ────────────────────────────────────────────────────

/// Receive state of a single inbound message.
pub struct FragmentReassembler {
    message_id: u32,
    fragments: [Option<FragmentBuffer>; MAX_FRAGMENTS],
    received: u32,
    last_index: Option<u8>,
    first_seen_ms: u64,
    expiry_ms: u64,
    assembled_size: OnceCell<usize>,
    pool: Arc<FragmentPool>,
    released: bool,
}

impl FragmentReassembler {
    pub fn new(message_id: u32, pool: Arc<FragmentPool>, now_ms: u64) -> Self {
        Self::with_expiry(message_id, pool, now_ms, MESSAGE_EXPIRY_MS)
    }

    pub fn with_expiry(
        message_id: u32,
        pool: Arc<FragmentPool>,
        now_ms: u64,
        expiry_ms: u64,
    ) -> Self {
        FragmentReassembler {
            message_id,
            fragments: std::array::from_fn(|_| None),
            received: 0,
            last_index: None,
            first_seen_ms: now_ms,
            expiry_ms,
            assembled_size: OnceCell::new(),
            pool,
            released: false,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn first_seen_ms(&self) -> u64 {
        self.first_seen_ms
    }

    fn corrupt(&self, index: u8, reason: &'static str) -> ReassemblyError {
        debug!(message_id = self.message_id, index, reason, "corrupt fragment");
        ReassemblyError::CorruptFragment {
            message_id: self.message_id,
            index,
            reason,
        }
    }

    fn highest_received(&self) -> Option<u8> {
        if self.received == 0 {
            None
        } else {
            Some((31 - self.received.leading_zeros()) as u8)
        }
    }

    /// Store one fragment. `Ok(true)` if it was new, `Ok(false)` for a
    /// duplicate. Errors leave the reassembler untouched.
    pub fn receive_fragment(&mut self, frame: &FragmentFrame) -> Result<bool, ReassemblyError> {
        if self.released {
            return Err(ReassemblyError::Released(self.message_id));
        }
        let index = frame.index;
        if frame.message_id != self.message_id {
            return Err(self.corrupt(index, "message id mismatch"));
        }
        if index as usize >= MAX_FRAGMENTS {
            return Err(self.corrupt(index, "index out of range"));
        }
        match self.last_index {
            Some(last) if index > last => {
                return Err(self.corrupt(index, "index beyond last fragment"));
            }
            Some(last) if frame.is_last && index != last => {
                return Err(self.corrupt(index, "second last fragment"));
            }
            None if frame.is_last && self.highest_received().is_some_and(|h| h > index) => {
                return Err(self.corrupt(index, "last fragment below a received index"));
            }
            _ => {}
        }

        let bit = 1u32 << index;
        if self.received & bit != 0 {
            return Ok(false);
        }

        let buffer = self.pool.acquire(&frame.payload).map_err(|e| match e {
            PoolError::Exhausted { .. } => ReassemblyError::PoolExhausted,
            PoolError::TooLarge { .. } => self.corrupt(index, "fragment larger than buffer"),
        })?;
        self.fragments[index as usize] = Some(buffer);
        self.received |= bit;
        if frame.is_last {
            self.last_index = Some(index);
        }
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) => {
                let full = ((1u64 << (last as u32 + 1)) - 1) as u32;
                self.received == full
            }
            None => false,
        }
    }

    /// Total payload bytes. Computed on first call once complete.
    pub fn assembled_size(&self) -> Option<usize> {
        if !self.is_complete() {
            return None;
        }
        Some(
            *self
                .assembled_size
                .get_or_init(|| self.fragments.iter().flatten().map(FragmentBuffer::len).sum()),
        )
    }

    /// Stored fragment payloads in ascending index order.
    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.fragments.iter().flatten().map(FragmentBuffer::as_slice)
    }

    /// Concatenate the payload. `None` until complete.
    pub fn assemble(&self) -> Option<Bytes> {
        let size = self.assembled_size()?;
        let mut out = BytesMut::with_capacity(size);
        for fragment in self.fragments() {
            out.extend_from_slice(fragment);
        }
        Some(out.freeze())
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.first_seen_ms) > self.expiry_ms
    }

    pub fn received(&self, index: usize) -> bool {
        index < MAX_FRAGMENTS && self.received & (1u32 << index) != 0
    }

    /// Fragments known to exist: `last + 1` once the last fragment arrived,
    /// otherwise one past the highest index seen.
    pub fn fragment_count(&self) -> u8 {
        match (self.last_index, self.highest_received()) {
            (Some(last), _) => last + 1,
            (None, Some(high)) => high + 1,
            (None, None) => 0,
        }
    }

    pub fn ack_bitfield(&self) -> AckBitfield {
        if self.is_complete() {
            AckBitfield::fully_received(self.message_id, self.fragment_count())
        } else {
            AckBitfield::partial(self.message_id, self.fragment_count(), self.received as u64)
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Hand every buffer back to the pool. Returns how many were returned;
    /// calling it again returns 0.
    pub fn release(&mut self) -> usize {
        if self.released {
            debug!(message_id = self.message_id, "release called twice");
            return 0;
        }
        self.released = true;
        let mut returned = 0;
        for slot in self.fragments.iter_mut() {
            if let Some(buffer) = slot.take() {
                self.pool.release(buffer);
                returned += 1;
            }
        }
        returned
    }
}

impl Drop for FragmentReassembler {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

impl std::fmt::Debug for FragmentReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentReassembler")
            .field("message_id", &self.message_id)
            .field("received", &format_args!("{:#034b}", self.received))
            .field("last_index", &self.last_index)
            .field("first_seen_ms", &self.first_seen_ms)
            .field("released", &self.released)
            .finish()
    }
}

// ─── InboundMessages ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    pub expiry_ms: u64,
    pub max_messages: usize,
    pub recently_completed: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            expiry_ms: MESSAGE_EXPIRY_MS,
            max_messages: MAX_INBOUND_MESSAGES,
            recently_completed: RECENTLY_COMPLETED_CAPACITY,
        }
    }
}

/// A fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub message_id: u32,
    pub payload: Bytes,
    pub fragment_count: u8,
    pub first_seen_ms: u64,
    pub completed_at_ms: u64,
}

/// What happened to a received fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Stored (or a duplicate of a stored fragment); message still incomplete.
    Partial { ack: AckBitfield, duplicate: bool },
    /// This fragment completed the message.
    Completed {
        message: CompletedMessage,
        ack: AckBitfield,
    },
    /// The message was already delivered; the sender missed our ACK.
    AlreadyDelivered { ack: AckBitfield },
}

impl Received {
    /// Bitfield to queue for the sender.
    pub fn ack(&self) -> AckBitfield {
        match self {
            Received::Partial { ack, .. } => *ack,
            Received::Completed { ack, .. } => *ack,
            Received::AlreadyDelivered { ack } => *ack,
        }
    }
}

/// Per-peer table of messages being reassembled.
pub struct InboundMessages {
    config: ReassemblyConfig,
    pool: Arc<FragmentPool>,
    messages: HashMap<u32, FragmentReassembler>,
    recent_order: VecDeque<u32>,
    recent: HashSet<u32>,
    /// Completed but not yet taken by the application.
    held: HashMap<u32, CompletedMessage>,
    stats: ReceiverStats,
}

impl InboundMessages {
    pub fn new(pool: Arc<FragmentPool>, config: ReassemblyConfig) -> Self {
        InboundMessages {
            config,
            pool,
            messages: HashMap::new(),
            recent_order: VecDeque::new(),
            recent: HashSet::new(),
            held: HashMap::new(),
            stats: ReceiverStats::default(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.messages.len()
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    fn remember_completed(&mut self, message_id: u32) {
        if self.config.recently_completed == 0 {
            return;
        }
        if self.recent.insert(message_id) {
            self.recent_order.push_back(message_id);
        }
        while self.recent_order.len() > self.config.recently_completed {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent.remove(&old);
            }
        }
    }

    fn record_error(&mut self, err: &ReassemblyError) {
        match err {
            ReassemblyError::CorruptFragment { .. } => self.stats.corrupt_fragments += 1,
            ReassemblyError::PoolExhausted => self.stats.pool_exhausted += 1,
            ReassemblyError::TooManyMessages(_) => self.stats.rejected_messages += 1,
            ReassemblyError::Released(_) => {}
        }
    }

    /// Route one fragment to its reassembler.
    pub fn receive(&mut self, frame: &FragmentFrame, now_ms: u64) -> Result<Received, ReassemblyError> {
        self.stats.fragments_received += 1;
        let message_id = frame.message_id;

        if let Some(message) = self.held.remove(&message_id) {
            self.stats.duplicate_fragments += 1;
            self.remember_completed(message_id);
            let ack = AckBitfield::fully_received(message_id, message.fragment_count);
            return Ok(Received::Completed { message, ack });
        }
        if self.recent.contains(&message_id) {
            self.stats.duplicate_fragments += 1;
            return Ok(Received::AlreadyDelivered {
                ack: AckBitfield::fully_received(message_id, 0),
            });
        }

        let result = match self.messages.get_mut(&message_id) {
            Some(reassembler) => reassembler.receive_fragment(frame),
            None => {
                if self.messages.len() >= self.config.max_messages {
                    Err(ReassemblyError::TooManyMessages(self.messages.len()))
                } else {
                    let mut reassembler = FragmentReassembler::with_expiry(
                        message_id,
                        self.pool.clone(),
                        now_ms,
                        self.config.expiry_ms,
                    );
                    let stored = reassembler.receive_fragment(frame);
                    if stored.is_ok() {
                        self.messages.insert(message_id, reassembler);
                    }
                    stored
                }
            }
        };

        let newly_stored = match result {
            Ok(stored) => stored,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };
        if !newly_stored {
            self.stats.duplicate_fragments += 1;
        }

        let complete = self
            .messages
            .get(&message_id)
            .is_some_and(FragmentReassembler::is_complete);
        if !complete {
            let ack = self
                .messages
                .get(&message_id)
                .map(FragmentReassembler::ack_bitfield)
                .unwrap_or_else(|| AckBitfield::partial(message_id, 0, 0));
            return Ok(Received::Partial {
                ack,
                duplicate: !newly_stored,
            });
        }

        let Some(mut reassembler) = self.messages.remove(&message_id) else {
            return Err(ReassemblyError::Released(message_id));
        };
        let ack = reassembler.ack_bitfield();
        let payload = reassembler.assemble().unwrap_or_default();
        let fragment_count = reassembler.fragment_count();
        let first_seen_ms = reassembler.first_seen_ms();
        reassembler.release();
        self.remember_completed(message_id);

        self.stats.messages_completed += 1;
        self.stats.bytes_delivered += payload.len() as u64;
        debug!(
            message_id,
            fragments = fragment_count,
            bytes = payload.len(),
            "message reassembled"
        );
        Ok(Received::Completed {
            message: CompletedMessage {
                message_id,
                payload,
                fragment_count,
                first_seen_ms,
                completed_at_ms: now_ms,
            },
            ack,
        })
    }

    /// Keep a completed message the caller could not deliver. It stays
    /// unacknowledged, and the next fragment the sender retransmits for it
    /// yields [`Received::Completed`] again. Returns false if the table is
    /// full, in which case the message is treated as delivered.
    pub fn hold(&mut self, message: CompletedMessage) -> bool {
        if self.held.len() >= self.config.max_messages {
            return false;
        }
        let message_id = message.message_id;
        if self.recent.remove(&message_id) {
            self.recent_order.retain(|id| *id != message_id);
        }
        self.stats.messages_deferred += 1;
        trace!(message_id, "completed message held for redelivery");
        self.held.insert(message_id, message);
        true
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Drop stalled messages and return their ids.
    pub fn expire(&mut self, now_ms: u64) -> Vec<u32> {
        let expired: Vec<u32> = self
            .messages
            .iter()
            .filter(|(_, r)| r.is_expired(now_ms))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(mut reassembler) = self.messages.remove(id) {
                let buffers = reassembler.release();
                debug!(
                    message_id = *id,
                    received = reassembler.fragment_count(),
                    buffers,
                    "inbound message expired"
                );
            }
        }
        self.stats.messages_expired += expired.len() as u64;

        let expiry_ms = self.config.expiry_ms;
        let before = self.held.len();
        self.held
            .retain(|_, m| now_ms.saturating_sub(m.completed_at_ms) <= expiry_ms);
        let dropped = before - self.held.len();
        if dropped > 0 {
            debug!(dropped, "held messages expired undelivered");
            self.stats.messages_expired += dropped as u64;
        }
        expired
    }

    /// Bitfields for every message still being reassembled.
    pub fn partial_acks(&self) -> Vec<AckBitfield> {
        self.messages
            .values()
            .filter(|r| r.received != 0)
            .map(FragmentReassembler::ack_bitfield)
            .collect()
    }

    /// Release everything, e.g. when the peer session closes.
    pub fn clear(&mut self) -> usize {
        let mut returned = 0;
        for (_, mut reassembler) in self.messages.drain() {
            returned += reassembler.release();
        }
        self.held.clear();
        returned
    }
}

impl std::fmt::Debug for InboundMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessages")
            .field("in_flight", &self.messages.len())
            .field("recently_completed", &self.recent.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<FragmentPool> {
        Arc::new(FragmentPool::new(64, 64))
    }

    fn frame(message_id: u32, index: u8, is_last: bool, data: &[u8]) -> FragmentFrame {
        FragmentFrame {
            message_id,
            index,
            is_last,
            payload: Bytes::copy_from_slice(data),
        }
    }

    // ─── Reassembler Tests ──────────────────────────────────────────────────

    #[test]
    fn out_of_order_fragments_assemble_in_index_order() {
        let pool = pool();
        let mut r = FragmentReassembler::new(1, pool.clone(), 0);
        for idx in [2u8, 0, 4, 1, 3] {
            let data = [b'a' + idx];
            assert_eq!(r.receive_fragment(&frame(1, idx, idx == 4, &data)), Ok(true));
        }
        assert!(r.is_complete());
        assert_eq!(r.assembled_size(), Some(5));
        assert_eq!(r.assemble().unwrap(), Bytes::from_static(b"abcde"));
        let order: Vec<&[u8]> = r.fragments().collect();
        assert_eq!(order[0], b"a");
        assert_eq!(order[4], b"e");
    }

    #[test]
    fn duplicate_takes_no_buffer() {
        let pool = pool();
        let mut r = FragmentReassembler::new(1, pool.clone(), 0);
        assert_eq!(r.receive_fragment(&frame(1, 0, false, b"x")), Ok(true));
        let before = pool.available();
        assert_eq!(r.receive_fragment(&frame(1, 0, false, b"x")), Ok(false));
        assert_eq!(pool.available(), before);
    }

    #[test]
    fn index_out_of_range_is_corrupt_and_harmless() {
        let pool = pool();
        let mut r = FragmentReassembler::new(1, pool.clone(), 0);
        r.receive_fragment(&frame(1, 0, false, b"a")).unwrap();
        let err = r.receive_fragment(&frame(1, 32, true, b"z")).unwrap_err();
        assert!(matches!(
            err,
            ReassemblyError::CorruptFragment { index: 32, .. }
        ));
        assert_eq!(r.fragment_count(), 1);
        assert!(!r.is_complete());
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn conflicting_last_flags_rejected() {
        let pool = pool();
        let mut r = FragmentReassembler::new(1, pool.clone(), 0);
        r.receive_fragment(&frame(1, 2, true, b"c")).unwrap();
        assert!(r.receive_fragment(&frame(1, 1, true, b"b")).is_err());
        assert!(r.receive_fragment(&frame(1, 3, false, b"d")).is_err());

        let mut r = FragmentReassembler::new(2, pool, 0);
        r.receive_fragment(&frame(2, 5, false, b"f")).unwrap();
        assert!(r.receive_fragment(&frame(2, 3, true, b"d")).is_err());
    }

    #[test]
    fn wrong_message_id_rejected() {
        let mut r = FragmentReassembler::new(1, pool(), 0);
        assert!(r.receive_fragment(&frame(2, 0, true, b"a")).is_err());
        assert_eq!(r.fragment_count(), 0);
    }

    #[test]
    fn single_fragment_message() {
        let mut r = FragmentReassembler::new(9, pool(), 0);
        r.receive_fragment(&frame(9, 0, true, b"only")).unwrap();
        assert!(r.is_complete());
        assert_eq!(r.ack_bitfield(), AckBitfield::fully_received(9, 1));
    }

    #[test]
    fn thirty_two_fragments_fill_the_table() {
        let mut r = FragmentReassembler::new(3, pool(), 0);
        for idx in (0..32u8).rev() {
            r.receive_fragment(&frame(3, idx, idx == 31, &[idx])).unwrap();
        }
        assert!(r.is_complete());
        assert_eq!(r.assembled_size(), Some(32));
    }

    #[test]
    fn expiry_window() {
        let r = FragmentReassembler::new(1, pool(), 1_000);
        assert!(!r.is_expired(11_000));
        assert!(r.is_expired(11_001));
    }

    #[test]
    fn release_restores_pool_once() {
        let pool = pool();
        let mut r = FragmentReassembler::new(1, pool.clone(), 0);
        for idx in 0..3u8 {
            r.receive_fragment(&frame(1, idx, idx == 2, b"data")).unwrap();
        }
        assert_eq!(pool.available(), 61);
        assert_eq!(r.release(), 3);
        assert_eq!(pool.available(), 64);
        assert_eq!(r.release(), 0);
        assert_eq!(pool.available(), 64);
        assert_eq!(
            r.receive_fragment(&frame(1, 0, false, b"x")),
            Err(ReassemblyError::Released(1))
        );
    }

    #[test]
    fn drop_returns_buffers() {
        let pool = pool();
        {
            let mut r = FragmentReassembler::new(1, pool.clone(), 0);
            r.receive_fragment(&frame(1, 0, false, b"x")).unwrap();
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn exhausted_pool_rejects_fragment() {
        let pool = Arc::new(FragmentPool::new(1, 8));
        let mut r = FragmentReassembler::new(1, pool, 0);
        r.receive_fragment(&frame(1, 0, false, b"a")).unwrap();
        assert_eq!(
            r.receive_fragment(&frame(1, 1, true, b"b")),
            Err(ReassemblyError::PoolExhausted)
        );
        assert!(!r.received(1));
    }

    #[test]
    fn partial_bitfield_snapshot() {
        let mut r = FragmentReassembler::new(4, pool(), 0);
        r.receive_fragment(&frame(4, 0, false, b"a")).unwrap();
        r.receive_fragment(&frame(4, 2, false, b"c")).unwrap();
        let ack = r.ack_bitfield();
        assert_eq!(ack.fragment_count(), 3);
        assert!(ack.received(0));
        assert!(!ack.received(1));
        assert!(ack.received(2));

        r.receive_fragment(&frame(4, 1, false, b"b")).unwrap();
        assert!(!ack.received(1), "snapshot must not change");
    }

    // ─── InboundMessages Tests ──────────────────────────────────────────────

    #[test]
    fn table_completes_and_releases() {
        let pool = pool();
        let mut inbound = InboundMessages::new(pool.clone(), ReassemblyConfig::default());
        let first = inbound.receive(&frame(5, 1, true, b"world"), 10).unwrap();
        assert!(matches!(first, Received::Partial { duplicate: false, .. }));
        assert_eq!(inbound.in_flight(), 1);

        match inbound.receive(&frame(5, 0, false, b"hello "), 20).unwrap() {
            Received::Completed { message, ack } => {
                assert_eq!(message.payload, Bytes::from_static(b"hello world"));
                assert_eq!(message.first_seen_ms, 10);
                assert_eq!(ack, AckBitfield::fully_received(5, 2));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(inbound.in_flight(), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(inbound.stats().messages_completed, 1);
    }

    #[test]
    fn late_duplicate_of_delivered_message_is_reacked() {
        let mut inbound = InboundMessages::new(pool(), ReassemblyConfig::default());
        inbound.receive(&frame(5, 0, true, b"x"), 0).unwrap();
        let again = inbound.receive(&frame(5, 0, true, b"x"), 5).unwrap();
        assert_eq!(
            again,
            Received::AlreadyDelivered {
                ack: AckBitfield::fully_received(5, 0)
            }
        );
        assert_eq!(inbound.in_flight(), 0);
    }

    #[test]
    fn held_message_completes_again_on_retransmission() {
        let mut inbound = InboundMessages::new(pool(), ReassemblyConfig::default());
        inbound.receive(&frame(5, 0, false, b"ab"), 0).unwrap();
        let done = inbound.receive(&frame(5, 1, true, b"cd"), 5).unwrap();
        let Received::Completed { message, .. } = done else {
            panic!("expected completion, got {done:?}");
        };
        assert!(inbound.hold(message.clone()));
        assert_eq!(inbound.held(), 1);

        // fragment 0 was acknowledged earlier; only the tail comes back
        let again = inbound.receive(&frame(5, 1, true, b"cd"), 1_000).unwrap();
        assert_eq!(
            again,
            Received::Completed {
                message: message.clone(),
                ack: AckBitfield::fully_received(5, 2),
            }
        );
        assert_eq!(inbound.held(), 0);
        assert_eq!(inbound.stats().messages_completed, 1);
        assert_eq!(inbound.stats().messages_deferred, 1);
        assert!(matches!(
            inbound.receive(&frame(5, 1, true, b"cd"), 1_010).unwrap(),
            Received::AlreadyDelivered { .. }
        ));
    }

    #[test]
    fn held_messages_expire() {
        let config = ReassemblyConfig {
            max_messages: 1,
            ..ReassemblyConfig::default()
        };
        let mut inbound = InboundMessages::new(pool(), config);
        let done = inbound.receive(&frame(5, 0, true, b"x"), 0).unwrap();
        let Received::Completed { message, .. } = done else {
            panic!("expected completion, got {done:?}");
        };
        assert!(inbound.hold(message.clone()));
        assert!(!inbound.hold(CompletedMessage { message_id: 6, ..message }));
        inbound.expire(MESSAGE_EXPIRY_MS + 1);
        assert_eq!(inbound.held(), 0);
        assert_eq!(inbound.stats().messages_expired, 1);
    }

    #[test]
    fn corrupt_first_fragment_creates_nothing() {
        let mut inbound = InboundMessages::new(pool(), ReassemblyConfig::default());
        assert!(inbound.receive(&frame(5, 40, true, b"x"), 0).is_err());
        assert_eq!(inbound.in_flight(), 0);
        assert_eq!(inbound.stats().corrupt_fragments, 1);
    }

    #[test]
    fn table_expires_stalled_messages() {
        let pool = pool();
        let mut inbound = InboundMessages::new(pool.clone(), ReassemblyConfig::default());
        inbound.receive(&frame(1, 0, false, b"a"), 0).unwrap();
        inbound.receive(&frame(2, 0, false, b"b"), 5_000).unwrap();
        assert_eq!(inbound.partial_acks().len(), 2);

        assert_eq!(inbound.expire(10_001), vec![1]);
        assert_eq!(inbound.in_flight(), 1);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(inbound.stats().messages_expired, 1);
    }

    #[test]
    fn table_bounds_concurrent_messages() {
        let config = ReassemblyConfig {
            max_messages: 2,
            ..ReassemblyConfig::default()
        };
        let mut inbound = InboundMessages::new(pool(), config);
        inbound.receive(&frame(1, 0, false, b"a"), 0).unwrap();
        inbound.receive(&frame(2, 0, false, b"b"), 0).unwrap();
        assert_eq!(
            inbound.receive(&frame(3, 0, false, b"c"), 0),
            Err(ReassemblyError::TooManyMessages(2))
        );
        assert!(inbound.receive(&frame(1, 1, true, b"z"), 0).is_ok());
    }

    #[test]
    fn clear_returns_every_buffer() {
        let pool = pool();
        let mut inbound = InboundMessages::new(pool.clone(), ReassemblyConfig::default());
        inbound.receive(&frame(1, 0, false, b"a"), 0).unwrap();
        inbound.receive(&frame(1, 1, false, b"b"), 0).unwrap();
        inbound.receive(&frame(2, 3, false, b"c"), 0).unwrap();
        assert_eq!(inbound.clear(), 3);
        assert_eq!(pool.outstanding(), 0);
    }
}
