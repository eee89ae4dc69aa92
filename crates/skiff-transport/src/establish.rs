//! # Establishment Manager
//!
//! Owns every handshake in progress, inbound or outbound, keyed by remote
//! host. At most one live handshake exists per host, and the number running
//! at once is bounded.
//!
//! Also keeps the retry tokens of protocol version 2: tokens we issued (to
//! check incoming requests against) and tokens peers issued to us (to skip
//! the token request next time).
//!
//! Lock order: the table lock is taken before any handshake's own lock.
//! Callers must not hold a handshake lock while calling into the manager.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rand::RngExt as _;
use thiserror::Error;
use tracing::{debug, info};

use crate::handshake::{
    FailureReason, InboundHandshake, OutboundHandshake, ProtocolVersion, QueuedMessage,
    RemoteHostId, TokenCheck,
};
use crate::stats::HandshakeStats;

/// Default concurrency limit.
pub const MAX_CONCURRENT_ESTABLISHMENTS: usize = 40;

/// Retry tokens are valid for one hour.
pub const TOKEN_LIFETIME_MS: u64 = 60 * 60 * 1_000;

/// Tokens kept per direction; the oldest is evicted beyond this.
pub const MAX_STORED_TOKENS: usize = 2_048;

#[derive(Debug, Clone)]
pub struct EstablishConfig {
    pub version: ProtocolVersion,
    /// Our UDP port, part of the signed data.
    pub local_port: u16,
    pub max_concurrent: usize,
    pub token_lifetime_ms: u64,
    pub max_tokens: usize,
}

impl Default for EstablishConfig {
    fn default() -> Self {
        EstablishConfig {
            version: ProtocolVersion::V1,
            local_port: 0,
            max_concurrent: MAX_CONCURRENT_ESTABLISHMENTS,
            token_lifetime_ms: TOKEN_LIFETIME_MS,
            max_tokens: MAX_STORED_TOKENS,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EstablishError {
    #[error("{remote}: {existing} handshake already in progress")]
    Busy {
        remote: RemoteHostId,
        existing: &'static str,
    },
    #[error("too many concurrent handshakes ({0})")]
    AtCapacity(usize),
}

// ─── Handshake handle ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Handshake {
    Inbound(Arc<Mutex<InboundHandshake>>),
    Outbound(Arc<Mutex<OutboundHandshake>>),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Handshake {
    pub fn direction(&self) -> &'static str {
        match self {
            Handshake::Inbound(_) => "inbound",
            Handshake::Outbound(_) => "outbound",
        }
    }

    /// `(terminal, failure)`.
    fn outcome(&self) -> (bool, Option<FailureReason>) {
        match self {
            Handshake::Inbound(h) => {
                let h = lock(h);
                (h.is_complete(), h.failure().cloned())
            }
            Handshake::Outbound(h) => {
                let h = lock(h);
                (h.is_complete(), h.failure().cloned())
            }
        }
    }

    fn is_timed_out(&self, now_ms: u64) -> bool {
        match self {
            Handshake::Inbound(h) => lock(h).is_timed_out(now_ms),
            Handshake::Outbound(h) => lock(h).is_timed_out(now_ms),
        }
    }

    fn next_send_ms(&self) -> u64 {
        match self {
            Handshake::Inbound(h) => lock(h).next_send_ms(),
            Handshake::Outbound(h) => lock(h).next_send_ms(),
        }
    }

    /// Fail it (if still live) and take back its queued messages.
    fn abandon(&self, reason: FailureReason) -> (FailureReason, Vec<QueuedMessage>) {
        match self {
            Handshake::Inbound(h) => {
                let mut h = lock(h);
                h.fail(reason.clone());
                (h.failure().cloned().unwrap_or(reason), h.take_queued())
            }
            Handshake::Outbound(h) => {
                let mut h = lock(h);
                h.fail(reason.clone());
                (h.failure().cloned().unwrap_or(reason), h.take_queued())
            }
        }
    }
}

/// A handshake removed by the sweep.
#[derive(Debug, Clone)]
pub struct AbandonedHandshake {
    pub remote: RemoteHostId,
    pub reason: FailureReason,
    /// Messages that were waiting on it; the caller reports them failed.
    pub queued: Vec<QueuedMessage>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub abandoned: Vec<AbandonedHandshake>,
    /// Live handshakes whose next send is due.
    pub due: Vec<(RemoteHostId, Handshake)>,
    /// Earliest future send time among live handshakes.
    pub next_wake_ms: Option<u64>,
}

// ─── Token store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct StoredToken {
    remote: RemoteHostId,
    token: u64,
    stored_ms: u64,
}

/// Bounded FIFO of tokens with single-use lookup.
#[derive(Debug, Default)]
struct TokenRing {
    tokens: VecDeque<StoredToken>,
}

impl TokenRing {
    fn push(&mut self, entry: StoredToken, max: usize) {
        self.tokens.retain(|t| t.remote != entry.remote || t.token != entry.token);
        while self.tokens.len() >= max.max(1) {
            self.tokens.pop_front();
        }
        self.tokens.push_back(entry);
    }

    fn take(&mut self, pred: impl Fn(&StoredToken) -> bool) -> Option<StoredToken> {
        let pos = self.tokens.iter().rposition(pred)?;
        self.tokens.remove(pos)
    }

    fn purge(&mut self, now_ms: u64, lifetime_ms: u64) {
        self.tokens
            .retain(|t| now_ms.saturating_sub(t.stored_ms) <= lifetime_ms);
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

struct Table {
    sessions: HashMap<RemoteHostId, Handshake>,
    stats: HandshakeStats,
}

struct Tokens {
    issued: TokenRing,
    received: TokenRing,
}

pub struct EstablishmentManager {
    config: EstablishConfig,
    table: Mutex<Table>,
    tokens: Mutex<Tokens>,
}

impl EstablishmentManager {
    pub fn new(config: EstablishConfig) -> Self {
        EstablishmentManager {
            config,
            table: Mutex::new(Table {
                sessions: HashMap::new(),
                stats: HandshakeStats::default(),
            }),
            tokens: Mutex::new(Tokens {
                issued: TokenRing::default(),
                received: TokenRing::default(),
            }),
        }
    }

    pub fn config(&self) -> &EstablishConfig {
        &self.config
    }

    pub fn version(&self) -> ProtocolVersion {
        self.config.version
    }

    pub fn len(&self) -> usize {
        lock(&self.table).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HandshakeStats {
        lock(&self.table).stats.clone()
    }

    pub fn get(&self, remote: &RemoteHostId) -> Option<Handshake> {
        lock(&self.table).sessions.get(remote).cloned()
    }

    /// The responder handshake for `remote`, created on first contact.
    /// Returns whether it was just created.
    pub fn inbound_for(
        &self,
        remote: RemoteHostId,
        now_ms: u64,
    ) -> Result<(Arc<Mutex<InboundHandshake>>, bool), EstablishError> {
        let mut table = lock(&self.table);
        match table.sessions.get(&remote) {
            Some(Handshake::Inbound(h)) => return Ok((h.clone(), false)),
            Some(existing @ Handshake::Outbound(_)) => {
                return Err(EstablishError::Busy {
                    remote,
                    existing: existing.direction(),
                })
            }
            None => {}
        }
        if table.sessions.len() >= self.config.max_concurrent {
            table.stats.rejected_at_capacity += 1;
            return Err(EstablishError::AtCapacity(table.sessions.len()));
        }
        let h = Arc::new(Mutex::new(InboundHandshake::new(
            remote,
            self.config.local_port,
            self.config.version,
            now_ms,
        )));
        table.sessions.insert(remote, Handshake::Inbound(h.clone()));
        table.stats.inbound_started += 1;
        debug!(peer = %remote, "inbound handshake started");
        Ok((h, true))
    }

    /// Start (or return the running) initiator handshake for `remote`.
    pub fn begin_outbound(
        &self,
        remote: RemoteHostId,
        remote_identity: Bytes,
        now_ms: u64,
    ) -> Result<(Arc<Mutex<OutboundHandshake>>, bool), EstablishError> {
        let mut table = lock(&self.table);
        match table.sessions.get(&remote) {
            Some(Handshake::Outbound(h)) => return Ok((h.clone(), false)),
            Some(existing @ Handshake::Inbound(_)) => {
                return Err(EstablishError::Busy {
                    remote,
                    existing: existing.direction(),
                })
            }
            None => {}
        }
        if table.sessions.len() >= self.config.max_concurrent {
            table.stats.rejected_at_capacity += 1;
            return Err(EstablishError::AtCapacity(table.sessions.len()));
        }
        let token = if self.config.version.uses_tokens() {
            self.take_received_token(&remote, now_ms)
        } else {
            None
        };
        let h = Arc::new(Mutex::new(OutboundHandshake::new(
            remote,
            remote_identity,
            self.config.version,
            token,
            now_ms,
        )));
        table.sessions.insert(remote, Handshake::Outbound(h.clone()));
        table.stats.outbound_started += 1;
        debug!(peer = %remote, has_token = token.is_some(), "outbound handshake started");
        Ok((h, true))
    }

    /// Remove a handshake that completed and was promoted to a session.
    pub fn complete(&self, remote: &RemoteHostId) -> Option<Handshake> {
        let mut table = lock(&self.table);
        let removed = table.sessions.remove(remote);
        if removed.is_some() {
            table.stats.completed += 1;
            info!(peer = %remote, "handshake complete");
        }
        removed
    }

    /// Fail and remove the handshake for `remote`.
    pub fn fail(&self, remote: &RemoteHostId, reason: FailureReason) -> Option<AbandonedHandshake> {
        let mut table = lock(&self.table);
        let h = table.sessions.remove(remote)?;
        let (reason, queued) = h.abandon(reason);
        if reason == FailureReason::Timeout {
            table.stats.timed_out += 1;
        } else {
            table.stats.failed += 1;
        }
        info!(peer = %remote, %reason, dropped = queued.len(), "handshake abandoned");
        Some(AbandonedHandshake {
            remote: *remote,
            reason,
            queued,
        })
    }

    /// Time out stale handshakes, drop failed ones, and report which live
    /// handshakes need a send. Completed handshakes are left for
    /// [`complete`](Self::complete).
    pub fn sweep(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let mut table = lock(&self.table);
        let mut remove = Vec::new();
        for (remote, h) in table.sessions.iter() {
            match h.outcome() {
                (_, Some(reason)) => {
                    remove.push((*remote, reason));
                    continue;
                }
                // Completed, awaiting promotion; `complete` removes it.
                (true, None) => continue,
                (false, None) => {}
            }
            if h.is_timed_out(now_ms) {
                remove.push((*remote, FailureReason::Timeout));
            } else {
                let next = h.next_send_ms();
                if next <= now_ms {
                    report.due.push((*remote, h.clone()));
                } else {
                    report.next_wake_ms = Some(report.next_wake_ms.map_or(next, |w| w.min(next)));
                }
            }
        }
        for (remote, reason) in remove {
            let Some(h) = table.sessions.remove(&remote) else {
                continue;
            };
            let (reason, queued) = h.abandon(reason);
            if reason == FailureReason::Timeout {
                table.stats.timed_out += 1;
            } else {
                table.stats.failed += 1;
            }
            debug!(peer = %remote, %reason, "handshake swept");
            report.abandoned.push(AbandonedHandshake {
                remote,
                reason,
                queued,
            });
        }
        drop(table);

        let mut tokens = lock(&self.tokens);
        tokens.issued.purge(now_ms, self.config.token_lifetime_ms);
        tokens.received.purge(now_ms, self.config.token_lifetime_ms);
        report
    }

    // ─── Tokens ─────────────────────────────────────────────────────────

    /// Issue a fresh non-zero token for `remote`.
    pub fn issue_token(&self, remote: RemoteHostId, now_ms: u64) -> u64 {
        let mut rng = rand::rng();
        let token = loop {
            let t: u64 = rng.random();
            if t != 0 {
                break t;
            }
        };
        lock(&self.tokens).issued.push(
            StoredToken {
                remote,
                token,
                stored_ms: now_ms,
            },
            self.config.max_tokens,
        );
        lock(&self.table).stats.tokens_issued += 1;
        token
    }

    /// Redeem a token presented by `remote`. Each issued token works once.
    pub fn check_token(&self, remote: &RemoteHostId, token: u64, now_ms: u64) -> TokenCheck {
        if !self.config.version.uses_tokens() {
            return TokenCheck::NotRequired;
        }
        let valid = token != 0
            && lock(&self.tokens)
                .issued
                .take(|t| t.remote == *remote && t.token == token)
                .is_some_and(|t| now_ms.saturating_sub(t.stored_ms) <= self.config.token_lifetime_ms);
        let mut table = lock(&self.table);
        if valid {
            table.stats.tokens_redeemed += 1;
            TokenCheck::Valid
        } else {
            table.stats.tokens_rejected += 1;
            TokenCheck::Invalid
        }
    }

    /// Keep a token `remote` issued to us for our next handshake with it.
    pub fn remember_token(&self, remote: RemoteHostId, token: u64, now_ms: u64) {
        if token == 0 {
            return;
        }
        lock(&self.tokens).received.push(
            StoredToken {
                remote,
                token,
                stored_ms: now_ms,
            },
            self.config.max_tokens,
        );
    }

    fn take_received_token(&self, remote: &RemoteHostId, now_ms: u64) -> Option<u64> {
        lock(&self.tokens)
            .received
            .take(|t| t.remote == *remote)
            .filter(|t| now_ms.saturating_sub(t.stored_ms) <= self.config.token_lifetime_ms)
            .map(|t| t.token)
    }
}

impl Default for EstablishmentManager {
    fn default() -> Self {
        Self::new(EstablishConfig::default())
    }
}

impl std::fmt::Debug for EstablishmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishmentManager")
            .field("config", &self.config)
            .field("handshakes", &self.len())
            .finish()
    }
}
