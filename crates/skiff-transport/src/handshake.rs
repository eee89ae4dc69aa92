//! # Session Establishment
//!
//! Pure state machines for both ends of the authenticated handshake. They do
//! no I/O: the endpoint feeds in decoded packets and asks what to send next.
//!
//! ## Responder
//!
//! ```text
//!                     (v2 only)
//!   Unknown ──TokenRequest──▶ TokenRequestReceived ──┐
//!      │  └──Request, bad token──▶ RequestBadToken ──┼──Retry sent──▶ RetrySent
//!      │                                             │                   │
//!   Request ◀────────────────────────────────────────┴──Request, token───┘
//!      ▼
//!   RequestReceived ──Created sent──▶ CreatedSent ──Confirmed──▶ ConfirmedPartially
//!                                          │                            │
//!                                          └──────────┬─────────────────┘
//!                                                     ▼
//!                                           ConfirmedCompletely ──verify──▶ Complete
//!                                                     └──bad signature──▶ Failed
//! ```
//!
//! ## Initiator
//!
//! ```text
//!   Unknown ──(v2, no token)──▶ TokenRequestSent ──Retry──▶ RetryReceived ─┐
//!      └───────────────────────────────────────────────────────────────────┴─▶ RequestSent
//!   RequestSent ──Created (signature ok)──▶ CreatedReceived ──Confirmed sent──▶ Complete
//! ```
//!
//! Retransmissions back off as `min(1000 << attempt, 15000)` ms. Any packet
//! accepted from the peer makes the next action due immediately.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::crypto::{CryptoFailure, CryptoService, KeyExchange, PeerId, SessionKeys};
use crate::wire::{
    ip_bytes, ConfirmSignature, SessionConfirmed, SessionCreated, SessionRequest, KEY_SIZE,
    SIGNATURE_SIZE,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// First retransmission delay; doubles per attempt.
pub const RETRANSMIT_DELAY_MS: u64 = 1_000;

/// Ceiling for the retransmission delay.
pub const MAX_DELAY_MS: u64 = 15_000;

/// Responder gives up on a handshake this old.
pub const MAX_INBOUND_ESTABLISH_MS: u64 = 12_000;

/// Initiator gives up on a handshake this old.
pub const MAX_OUTBOUND_ESTABLISH_MS: u64 = 25_000;

/// How long a responder waits for a new request after sending Retry.
pub const RETRY_WINDOW_MS: u64 = 5 * RETRANSMIT_DELAY_MS;

/// Application messages held per peer while the handshake runs.
pub const MAX_QUEUED_PER_PEER: usize = 16;

/// Identity bytes per SessionConfirmed fragment.
pub const CONFIRM_FRAGMENT_SIZE: usize = 512;

/// Retransmission delay for the given zero-based attempt.
pub fn backoff_delay(attempt: u32) -> u64 {
    if attempt >= 16 {
        MAX_DELAY_MS
    } else {
        (RETRANSMIT_DELAY_MS << attempt).min(MAX_DELAY_MS)
    }
}

// ─── Identifiers ────────────────────────────────────────────────────────────

/// Remote endpoint a handshake or session is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteHostId {
    pub ip: IpAddr,
    pub port: u16,
}

impl RemoteHostId {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        RemoteHostId { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for RemoteHostId {
    fn from(addr: SocketAddr) -> Self {
        RemoteHostId::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for RemoteHostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Request / Created / Confirmed only.
    #[default]
    V1,
    /// Adds the token request / retry exchange in front of the request.
    V2,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    pub fn uses_tokens(self) -> bool {
        self == ProtocolVersion::V2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("timed out")]
    Timeout,
    #[error("identity signature did not verify")]
    SignatureInvalid,
    #[error("retry token mismatch")]
    TokenMismatch,
    #[error("key agreement failed")]
    KeyAgreement,
    #[error("destroyed by peer")]
    Destroyed,
    #[error("rejected locally")]
    Rejected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("{op} not valid in state {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },
    #[error("handshake already complete")]
    AlreadyComplete,
    #[error("handshake failed: {0}")]
    Failed(FailureReason),
    #[error("pending message queue full ({0})")]
    QueueFull(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoFailure),
}

/// Result of the responder's retry-token check for a session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    /// Protocol version 1 has no tokens.
    NotRequired,
    Valid,
    Invalid,
}

// ─── Retransmission schedule ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RetransmitSchedule {
    sent_count: u32,
    last_send_ms: Option<u64>,
    next_send_ms: u64,
}

impl RetransmitSchedule {
    fn starting_at(now_ms: u64) -> Self {
        RetransmitSchedule {
            sent_count: 0,
            last_send_ms: None,
            next_send_ms: now_ms,
        }
    }

    /// Record a send and schedule the next one. Returns the delay used.
    pub fn on_sent(&mut self, now_ms: u64) -> u64 {
        let delay = backoff_delay(self.sent_count);
        self.sent_count += 1;
        self.last_send_ms = Some(now_ms);
        self.next_send_ms = now_ms + delay;
        delay
    }

    /// Make the next action due at `now_ms`.
    pub fn reset(&mut self, now_ms: u64) {
        self.next_send_ms = now_ms;
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    pub fn last_send_ms(&self) -> Option<u64> {
        self.last_send_ms
    }

    pub fn next_send_ms(&self) -> u64 {
        self.next_send_ms
    }
}

// ─── Pending messages ───────────────────────────────────────────────────────

/// Application message waiting for the handshake to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Caller-visible handle; resubmitting the same handle is a no-op.
    pub handle: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default)]
struct PendingQueue {
    queue: VecDeque<QueuedMessage>,
}

impl PendingQueue {
    fn push(&mut self, msg: QueuedMessage) -> Result<bool, HandshakeError> {
        if self.queue.iter().any(|m| m.handle == msg.handle) {
            return Ok(false);
        }
        if self.queue.len() >= MAX_QUEUED_PER_PEER {
            return Err(HandshakeError::QueueFull(self.queue.len()));
        }
        self.queue.push_back(msg);
        Ok(true)
    }

    fn drain(&mut self) -> Vec<QueuedMessage> {
        self.queue.drain(..).collect()
    }
}

// ─── Signed data ────────────────────────────────────────────────────────────

/// Bytes both signatures cover:
/// `X ‖ Y ‖ alice ip ‖ alice port ‖ bob ip ‖ bob port ‖ relay tag ‖ signed-on`.
pub fn signed_data(
    x: &[u8],
    y: &[u8],
    alice: (IpAddr, u16),
    bob: (IpAddr, u16),
    relay_tag: u32,
    signed_on: u32,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(x.len() + y.len() + 2 * (16 + 2) + 8);
    data.extend_from_slice(x);
    data.extend_from_slice(y);
    data.extend_from_slice(&ip_bytes(&alice.0));
    data.extend_from_slice(&alice.1.to_be_bytes());
    data.extend_from_slice(&ip_bytes(&bob.0));
    data.extend_from_slice(&bob.1.to_be_bytes());
    data.extend_from_slice(&relay_tag.to_be_bytes());
    data.extend_from_slice(&signed_on.to_be_bytes());
    data
}

/// A finished handshake, ready to become a peer session.
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    pub remote: RemoteHostId,
    pub role: Role,
    pub peer_id: PeerId,
    pub keys: SessionKeys,
    pub established_ms: u64,
    /// Messages submitted while the handshake ran, in submission order.
    pub queued: Vec<QueuedMessage>,
    /// Initiator only: the confirmation, to resend if the responder
    /// repeats its SessionCreated.
    pub confirmation: Vec<SessionConfirmed>,
}

// ─── Responder ──────────────────────────────────────────────────────────────

/// Responder handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundState {
    /// Created, nothing accepted yet.
    Unknown,
    /// v2: peer asked for a token; Retry owed.
    TokenRequestReceived,
    /// v2: request arrived without a valid token; Retry owed.
    RequestBadTokenReceived,
    /// v2: Retry sent, waiting for a request carrying the token.
    RetrySent,
    /// Request accepted; SessionCreated owed.
    RequestReceived,
    /// SessionCreated sent at least once.
    CreatedSent,
    /// Some confirmation fragments arrived.
    ConfirmedPartially,
    /// Every confirmation fragment and the signature arrived.
    ConfirmedCompletely,
    /// Identity verified; ready for promotion.
    Complete,
    /// Terminal failure.
    Failed,
}

impl InboundState {
    pub fn as_str(self) -> &'static str {
        match self {
            InboundState::Unknown => "unknown",
            InboundState::TokenRequestReceived => "token-request-received",
            InboundState::RequestBadTokenReceived => "request-bad-token-received",
            InboundState::RetrySent => "retry-sent",
            InboundState::RequestReceived => "request-received",
            InboundState::CreatedSent => "created-sent",
            InboundState::ConfirmedPartially => "confirmed-partially",
            InboundState::ConfirmedCompletely => "confirmed-completely",
            InboundState::Complete => "complete",
            InboundState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InboundState::Complete | InboundState::Failed)
    }
}

#[derive(Debug)]
pub struct InboundHandshake {
    remote: RemoteHostId,
    local_port: u16,
    version: ProtocolVersion,
    state: InboundState,
    started_ms: u64,
    schedule: RetransmitSchedule,
    peer_ephemeral: Option<Bytes>,
    observed_ip: Option<IpAddr>,
    accepted_token: Option<u64>,
    retry_token: Option<u64>,
    keys: Option<SessionKeys>,
    local_ephemeral: Option<Bytes>,
    created: Option<SessionCreated>,
    confirm_fragments: Vec<Option<Bytes>>,
    confirm_signature: Option<ConfirmSignature>,
    queued: PendingQueue,
    failure: Option<FailureReason>,
}

impl InboundHandshake {
    pub fn new(remote: RemoteHostId, local_port: u16, version: ProtocolVersion, now_ms: u64) -> Self {
        InboundHandshake {
            remote,
            local_port,
            version,
            state: InboundState::Unknown,
            started_ms: now_ms,
            schedule: RetransmitSchedule::starting_at(now_ms),
            peer_ephemeral: None,
            observed_ip: None,
            accepted_token: None,
            retry_token: None,
            keys: None,
            local_ephemeral: None,
            created: None,
            confirm_fragments: Vec::new(),
            confirm_signature: None,
            queued: PendingQueue::default(),
            failure: None,
        }
    }

    pub fn remote(&self) -> RemoteHostId {
        self.remote
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> InboundState {
        self.state
    }

    /// True once the handshake can make no further progress, either way.
    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn started_ms(&self) -> u64 {
        self.started_ms
    }

    pub fn lifetime_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_ms)
    }

    pub fn next_send_ms(&self) -> u64 {
        self.schedule.next_send_ms()
    }

    pub fn schedule(&self) -> &RetransmitSchedule {
        &self.schedule
    }

    /// Token issued in our Retry, if any.
    pub fn retry_token(&self) -> Option<u64> {
        self.retry_token
    }

    /// Token the accepted request carried.
    pub fn accepted_token(&self) -> Option<u64> {
        self.accepted_token
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        let bound = if self.state == InboundState::RetrySent {
            RETRY_WINDOW_MS
        } else {
            MAX_INBOUND_ESTABLISH_MS
        };
        self.lifetime_ms(now_ms) > bound
    }

    fn invalid(&self, op: &'static str) -> HandshakeError {
        HandshakeError::InvalidState {
            op,
            state: self.state.as_str(),
        }
    }

    fn check_live(&self) -> Result<(), HandshakeError> {
        match self.state {
            InboundState::Failed => Err(HandshakeError::Failed(
                self.failure.clone().unwrap_or(FailureReason::Rejected),
            )),
            InboundState::Complete => Err(HandshakeError::AlreadyComplete),
            _ => Ok(()),
        }
    }

    /// Move to `Failed`. No effect once terminal.
    pub fn fail(&mut self, reason: FailureReason) {
        if self.state.is_terminal() {
            return;
        }
        debug!(peer = %self.remote, state = self.state.as_str(), %reason, "inbound handshake failed");
        self.state = InboundState::Failed;
        self.failure = Some(reason);
    }

    /// v2 token request; `token` is what our Retry will carry.
    pub fn receive_token_request(&mut self, token: u64, now_ms: u64) -> Result<(), HandshakeError> {
        self.check_live()?;
        if !self.version.uses_tokens() {
            return Err(self.invalid("token request"));
        }
        match self.state {
            InboundState::Unknown => {
                self.state = InboundState::TokenRequestReceived;
                self.retry_token = Some(token);
            }
            InboundState::TokenRequestReceived | InboundState::RetrySent => {}
            _ => return Err(self.invalid("token request")),
        }
        self.schedule.reset(now_ms);
        Ok(())
    }

    /// Session request. Only the first copy of each field is kept.
    pub fn receive_session_request(
        &mut self,
        req: &SessionRequest,
        token: TokenCheck,
        now_ms: u64,
    ) -> Result<(), HandshakeError> {
        self.check_live()?;
        if req.ephemeral_key.len() != KEY_SIZE {
            return Err(HandshakeError::Malformed("ephemeral key size"));
        }
        match self.state {
            InboundState::ConfirmedPartially | InboundState::ConfirmedCompletely => {
                return Ok(());
            }
            InboundState::RequestReceived | InboundState::CreatedSent => {
                // Retransmission: our SessionCreated was lost.
                if self.version.uses_tokens() && Some(req.token) != self.accepted_token {
                    return Err(HandshakeError::Malformed("token changed on retransmit"));
                }
                self.schedule.reset(now_ms);
                return Ok(());
            }
            _ => {}
        }

        if self.version.uses_tokens() && token != TokenCheck::Valid {
            if self.state == InboundState::RetrySent {
                self.fail(FailureReason::TokenMismatch);
                return Err(HandshakeError::Failed(FailureReason::TokenMismatch));
            }
            self.state = InboundState::RequestBadTokenReceived;
            self.schedule.reset(now_ms);
            return Ok(());
        }

        if self.peer_ephemeral.is_none() {
            self.peer_ephemeral = Some(req.ephemeral_key.clone());
        }
        if self.observed_ip.is_none() {
            self.observed_ip = Some(req.observed_ip);
        }
        if self.version.uses_tokens() && self.accepted_token.is_none() {
            self.accepted_token = Some(req.token);
        }
        self.state = InboundState::RequestReceived;
        self.schedule.reset(now_ms);
        Ok(())
    }

    /// Assign the token a Retry to this peer will carry.
    pub fn set_retry_token(&mut self, token: u64) {
        self.retry_token = Some(token);
    }

    /// Record that a Retry went out.
    pub fn retry_packet_sent(&mut self, now_ms: u64) -> Result<(), HandshakeError> {
        self.check_live()?;
        match self.state {
            InboundState::TokenRequestReceived
            | InboundState::RequestBadTokenReceived
            | InboundState::RetrySent => {}
            _ => return Err(self.invalid("retry sent")),
        }
        self.schedule.on_sent(now_ms);
        self.schedule.next_send_ms = now_ms + RETRY_WINDOW_MS;
        self.state = InboundState::RetrySent;
        Ok(())
    }

    /// Build (once) the SessionCreated reply. Retransmissions reuse it.
    pub fn prepare_created(
        &mut self,
        crypto: &dyn CryptoService,
        relay_tag: u32,
        signed_on: u32,
    ) -> Result<SessionCreated, HandshakeError> {
        self.check_live()?;
        match self.state {
            InboundState::RequestReceived
            | InboundState::CreatedSent
            | InboundState::ConfirmedPartially => {}
            _ => return Err(self.invalid("prepare created")),
        }
        if let Some(created) = &self.created {
            return Ok(created.clone());
        }
        let x = self
            .peer_ephemeral
            .clone()
            .ok_or(HandshakeError::Malformed("missing ephemeral key"))?;
        let bob_ip = self
            .observed_ip
            .ok_or(HandshakeError::Malformed("missing observed address"))?;

        let agreed = crypto
            .key_exchange()
            .and_then(|kx| {
                let y = kx.public_key();
                kx.complete(&x).map(|keys| (y, keys))
            });
        let (y, keys) = match agreed {
            Ok(pair) => pair,
            Err(e) => {
                self.fail(FailureReason::KeyAgreement);
                return Err(e.into());
            }
        };

        let data = signed_data(
            &x,
            &y,
            (self.remote.ip, self.remote.port),
            (bob_ip, self.local_port),
            relay_tag,
            signed_on,
        );
        let signature = crypto.sign(&data)?;
        let created = SessionCreated {
            ephemeral_key: y.clone(),
            alice_ip: self.remote.ip,
            alice_port: self.remote.port,
            relay_tag,
            signed_on,
            signature,
        };
        self.local_ephemeral = Some(y);
        self.keys = Some(keys);
        self.created = Some(created.clone());
        Ok(created)
    }

    /// Record that SessionCreated went out. Returns the backoff delay.
    /// A resend while confirmation fragments are missing keeps the
    /// fragments already received.
    pub fn created_packet_sent(&mut self, now_ms: u64) -> Result<u64, HandshakeError> {
        self.check_live()?;
        match self.state {
            InboundState::RequestReceived | InboundState::CreatedSent => {
                self.state = InboundState::CreatedSent;
            }
            InboundState::ConfirmedPartially => {}
            _ => return Err(self.invalid("created sent")),
        }
        Ok(self.schedule.on_sent(now_ms))
    }

    /// One SessionConfirmed fragment.
    pub fn receive_session_confirmed(
        &mut self,
        confirmed: &SessionConfirmed,
        now_ms: u64,
    ) -> Result<(), HandshakeError> {
        self.check_live()?;
        match self.state {
            InboundState::CreatedSent | InboundState::ConfirmedPartially => {}
            InboundState::ConfirmedCompletely => return Ok(()),
            _ => return Err(self.invalid("session confirmed")),
        }
        let total = confirmed.total as usize;
        if total == 0 || confirmed.total > SessionConfirmed::MAX_FRAGMENTS {
            return Err(HandshakeError::Malformed("confirm fragment total"));
        }
        if confirmed.index as usize >= total {
            return Err(HandshakeError::Malformed("confirm fragment index"));
        }
        if self.confirm_fragments.is_empty() {
            self.confirm_fragments = vec![None; total];
        } else if self.confirm_fragments.len() != total {
            return Err(HandshakeError::Malformed("confirm fragment total changed"));
        }
        if confirmed.is_final() {
            match &confirmed.signature {
                Some(sig) if sig.signature.len() == SIGNATURE_SIZE => {
                    if self.confirm_signature.is_none() {
                        self.confirm_signature = Some(sig.clone());
                    }
                }
                _ => return Err(HandshakeError::Malformed("confirm signature")),
            }
        }
        let slot = &mut self.confirm_fragments[confirmed.index as usize];
        if slot.is_none() {
            *slot = Some(confirmed.identity_fragment.clone());
        }

        let all = self.confirm_fragments.iter().all(Option::is_some);
        if all && self.confirm_signature.is_some() {
            self.state = InboundState::ConfirmedCompletely;
            self.schedule.reset(now_ms);
        } else {
            // SessionCreated goes out again on its own schedule in case
            // the rest of the confirmation was lost.
            self.state = InboundState::ConfirmedPartially;
        }
        Ok(())
    }

    /// Verify the peer's identity signature and complete the handshake.
    pub fn verify_identity(
        &mut self,
        crypto: &dyn CryptoService,
        now_ms: u64,
    ) -> Result<EstablishedSession, HandshakeError> {
        self.check_live()?;
        if self.state != InboundState::ConfirmedCompletely {
            return Err(self.invalid("verify identity"));
        }
        let (Some(x), Some(y), Some(bob_ip), Some(sig), Some(keys)) = (
            self.peer_ephemeral.as_ref(),
            self.local_ephemeral.as_ref(),
            self.observed_ip,
            self.confirm_signature.as_ref(),
            self.keys.clone(),
        ) else {
            return Err(self.invalid("verify identity"));
        };
        let identity: Vec<u8> = self
            .confirm_fragments
            .iter()
            .flatten()
            .flat_map(|f| f.iter().copied())
            .collect();
        let relay_tag = self.created.as_ref().map(|c| c.relay_tag).unwrap_or(0);
        let data = signed_data(
            x,
            y,
            (self.remote.ip, self.remote.port),
            (bob_ip, self.local_port),
            relay_tag,
            sig.signed_on,
        );
        match crypto.verify_identity(&identity, &data, &sig.signature) {
            Ok(peer_id) => {
                self.state = InboundState::Complete;
                debug!(peer = %self.remote, %peer_id, "inbound handshake complete");
                Ok(EstablishedSession {
                    remote: self.remote,
                    role: Role::Responder,
                    peer_id,
                    keys,
                    established_ms: now_ms,
                    queued: self.queued.drain(),
                    confirmation: Vec::new(),
                })
            }
            Err(e) => {
                debug!(peer = %self.remote, error = %e, "identity verification failed");
                self.fail(FailureReason::SignatureInvalid);
                Err(HandshakeError::Failed(FailureReason::SignatureInvalid))
            }
        }
    }

    /// Hold a message until the handshake completes. `Ok(false)` if the
    /// handle is already queued.
    pub fn queue_message(&mut self, msg: QueuedMessage) -> Result<bool, HandshakeError> {
        self.check_live()?;
        self.queued.push(msg)
    }

    /// Remove every queued message, e.g. to report them failed.
    pub fn take_queued(&mut self) -> Vec<QueuedMessage> {
        self.queued.drain()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.queue.len()
    }
}

// ─── Initiator ──────────────────────────────────────────────────────────────

/// Initiator handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundState {
    /// Nothing sent yet.
    Unknown,
    /// v2: token request sent, waiting for Retry.
    TokenRequestSent,
    /// v2: Retry received; request owed.
    RetryReceived,
    /// SessionRequest sent at least once.
    RequestSent,
    /// SessionCreated verified; confirmation owed.
    CreatedReceived,
    /// Confirmation sent; ready for promotion.
    Complete,
    /// Terminal failure.
    Failed,
}

impl OutboundState {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundState::Unknown => "unknown",
            OutboundState::TokenRequestSent => "token-request-sent",
            OutboundState::RetryReceived => "retry-received",
            OutboundState::RequestSent => "request-sent",
            OutboundState::CreatedReceived => "created-received",
            OutboundState::Complete => "complete",
            OutboundState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboundState::Complete | OutboundState::Failed)
    }
}

/// What the initiator should send next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundAction {
    TokenRequest,
    SessionRequest,
    SessionConfirmed,
    None,
}

pub struct OutboundHandshake {
    remote: RemoteHostId,
    remote_identity: Bytes,
    version: ProtocolVersion,
    state: OutboundState,
    started_ms: u64,
    schedule: RetransmitSchedule,
    token: Option<u64>,
    kx: Option<Box<dyn KeyExchange>>,
    local_ephemeral: Option<Bytes>,
    peer_ephemeral: Option<Bytes>,
    keys: Option<SessionKeys>,
    our_address: Option<(IpAddr, u16)>,
    relay_tag: u32,
    peer_id: Option<PeerId>,
    confirmation: Vec<SessionConfirmed>,
    queued: PendingQueue,
    failure: Option<FailureReason>,
}

impl OutboundHandshake {
    /// `remote_identity` comes from the caller's address book; `token` is a
    /// previously received retry token, if any.
    pub fn new(
        remote: RemoteHostId,
        remote_identity: Bytes,
        version: ProtocolVersion,
        token: Option<u64>,
        now_ms: u64,
    ) -> Self {
        OutboundHandshake {
            remote,
            remote_identity,
            version,
            state: OutboundState::Unknown,
            started_ms: now_ms,
            schedule: RetransmitSchedule::starting_at(now_ms),
            token: token.filter(|t| *t != 0),
            kx: None,
            local_ephemeral: None,
            peer_ephemeral: None,
            keys: None,
            our_address: None,
            relay_tag: 0,
            peer_id: None,
            confirmation: Vec::new(),
            queued: PendingQueue::default(),
            failure: None,
        }
    }

    pub fn remote(&self) -> RemoteHostId {
        self.remote
    }

    pub fn state(&self) -> OutboundState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn lifetime_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_ms)
    }

    pub fn next_send_ms(&self) -> u64 {
        self.schedule.next_send_ms()
    }

    pub fn schedule(&self) -> &RetransmitSchedule {
        &self.schedule
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        self.lifetime_ms(now_ms) > MAX_OUTBOUND_ESTABLISH_MS
    }

    /// The responder's view of our address, learned from SessionCreated.
    pub fn our_address(&self) -> Option<(IpAddr, u16)> {
        self.our_address
    }

    fn invalid(&self, op: &'static str) -> HandshakeError {
        HandshakeError::InvalidState {
            op,
            state: self.state.as_str(),
        }
    }

    fn check_live(&self) -> Result<(), HandshakeError> {
        match self.state {
            OutboundState::Failed => Err(HandshakeError::Failed(
                self.failure.clone().unwrap_or(FailureReason::Rejected),
            )),
            OutboundState::Complete => Err(HandshakeError::AlreadyComplete),
            _ => Ok(()),
        }
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if self.state.is_terminal() {
            return;
        }
        debug!(peer = %self.remote, state = self.state.as_str(), %reason, "outbound handshake failed");
        self.state = OutboundState::Failed;
        self.failure = Some(reason);
    }

    /// Next packet to send.
    pub fn next_action(&self) -> OutboundAction {
        match self.state {
            OutboundState::Unknown if self.version.uses_tokens() && self.token.is_none() => {
                OutboundAction::TokenRequest
            }
            OutboundState::TokenRequestSent => OutboundAction::TokenRequest,
            OutboundState::Unknown | OutboundState::RetryReceived | OutboundState::RequestSent => {
                OutboundAction::SessionRequest
            }
            OutboundState::CreatedReceived => OutboundAction::SessionConfirmed,
            OutboundState::Complete | OutboundState::Failed => OutboundAction::None,
        }
    }

    pub fn token_request_sent(&mut self, now_ms: u64) -> Result<u64, HandshakeError> {
        self.check_live()?;
        match self.state {
            OutboundState::Unknown | OutboundState::TokenRequestSent => {}
            _ => return Err(self.invalid("token request sent")),
        }
        self.state = OutboundState::TokenRequestSent;
        Ok(self.schedule.on_sent(now_ms))
    }

    pub fn receive_retry(&mut self, token: u64, now_ms: u64) -> Result<(), HandshakeError> {
        self.check_live()?;
        if token == 0 {
            return Err(HandshakeError::Malformed("zero retry token"));
        }
        match self.state {
            OutboundState::TokenRequestSent | OutboundState::RequestSent => {}
            OutboundState::RetryReceived => return Ok(()),
            _ => return Err(self.invalid("retry")),
        }
        self.token = Some(token);
        self.state = OutboundState::RetryReceived;
        self.schedule = RetransmitSchedule::starting_at(now_ms);
        Ok(())
    }

    pub fn prepare_request(
        &mut self,
        crypto: &dyn CryptoService,
    ) -> Result<SessionRequest, HandshakeError> {
        self.check_live()?;
        if self.next_action() != OutboundAction::SessionRequest {
            return Err(self.invalid("prepare request"));
        }
        let x = match &self.local_ephemeral {
            Some(x) => x.clone(),
            None => {
                let kx = crypto.key_exchange().inspect_err(|_| {
                    self.fail(FailureReason::KeyAgreement);
                })?;
                let x = kx.public_key();
                self.kx = Some(kx);
                self.local_ephemeral = Some(x.clone());
                x
            }
        };
        Ok(SessionRequest {
            ephemeral_key: x,
            observed_ip: self.remote.ip,
            token: self.token.unwrap_or(0),
        })
    }

    pub fn request_sent(&mut self, now_ms: u64) -> Result<u64, HandshakeError> {
        self.check_live()?;
        match self.state {
            OutboundState::Unknown | OutboundState::RetryReceived | OutboundState::RequestSent => {}
            _ => return Err(self.invalid("request sent")),
        }
        self.state = OutboundState::RequestSent;
        Ok(self.schedule.on_sent(now_ms))
    }

    /// Derive keys from Y and verify the responder's signature.
    pub fn receive_session_created(
        &mut self,
        created: &SessionCreated,
        crypto: &dyn CryptoService,
        now_ms: u64,
    ) -> Result<(), HandshakeError> {
        self.check_live()?;
        match self.state {
            OutboundState::RequestSent => {}
            OutboundState::CreatedReceived => {
                self.schedule.reset(now_ms);
                return Ok(());
            }
            _ => return Err(self.invalid("session created")),
        }
        if created.ephemeral_key.len() != KEY_SIZE {
            return Err(HandshakeError::Malformed("ephemeral key size"));
        }
        if created.signature.len() != SIGNATURE_SIZE {
            return Err(HandshakeError::Malformed("created signature size"));
        }
        let (Some(kx), Some(x)) = (self.kx.take(), self.local_ephemeral.clone()) else {
            return Err(self.invalid("session created"));
        };
        let keys = match kx.complete(&created.ephemeral_key) {
            Ok(keys) => keys,
            Err(e) => {
                self.fail(FailureReason::KeyAgreement);
                return Err(e.into());
            }
        };
        let data = signed_data(
            &x,
            &created.ephemeral_key,
            (created.alice_ip, created.alice_port),
            (self.remote.ip, self.remote.port),
            created.relay_tag,
            created.signed_on,
        );
        match crypto.verify_identity(&self.remote_identity, &data, &created.signature) {
            Ok(peer_id) => self.peer_id = Some(peer_id),
            Err(e) => {
                debug!(peer = %self.remote, error = %e, "responder signature rejected");
                self.fail(FailureReason::SignatureInvalid);
                return Err(HandshakeError::Failed(FailureReason::SignatureInvalid));
            }
        }
        self.peer_ephemeral = Some(created.ephemeral_key.clone());
        self.keys = Some(keys);
        self.our_address = Some((created.alice_ip, created.alice_port));
        self.relay_tag = created.relay_tag;
        self.state = OutboundState::CreatedReceived;
        self.schedule.reset(now_ms);
        Ok(())
    }

    /// Split our identity into confirmation fragments, the last one signed.
    pub fn prepare_confirmed(
        &mut self,
        crypto: &dyn CryptoService,
        signed_on: u32,
    ) -> Result<Vec<SessionConfirmed>, HandshakeError> {
        self.check_live()?;
        if self.state != OutboundState::CreatedReceived {
            return Err(self.invalid("prepare confirmed"));
        }
        if !self.confirmation.is_empty() {
            return Ok(self.confirmation.clone());
        }
        let (Some(x), Some(y), Some(alice)) = (
            self.local_ephemeral.as_ref(),
            self.peer_ephemeral.as_ref(),
            self.our_address,
        ) else {
            return Err(self.invalid("prepare confirmed"));
        };

        let identity = crypto.local_identity();
        let chunks: Vec<Bytes> = if identity.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..identity.len())
                .step_by(CONFIRM_FRAGMENT_SIZE)
                .map(|start| identity.slice(start..(start + CONFIRM_FRAGMENT_SIZE).min(identity.len())))
                .collect()
        };
        if chunks.len() > SessionConfirmed::MAX_FRAGMENTS as usize {
            return Err(HandshakeError::Malformed("identity too large to confirm"));
        }

        let data = signed_data(
            x,
            y,
            alice,
            (self.remote.ip, self.remote.port),
            self.relay_tag,
            signed_on,
        );
        let signature = crypto.sign(&data)?;
        let total = chunks.len() as u8;
        let fragments: Vec<SessionConfirmed> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let index = i as u8;
                SessionConfirmed {
                    index,
                    total,
                    identity_fragment: chunk,
                    signature: (index == total - 1).then(|| ConfirmSignature {
                        signed_on,
                        signature: signature.clone(),
                    }),
                }
            })
            .collect();
        self.confirmation = fragments.clone();
        Ok(fragments)
    }

    /// Confirmation sent: the handshake is done.
    pub fn confirmed_sent(&mut self, now_ms: u64) -> Result<EstablishedSession, HandshakeError> {
        self.check_live()?;
        if self.state != OutboundState::CreatedReceived || self.confirmation.is_empty() {
            return Err(self.invalid("confirmed sent"));
        }
        let (Some(peer_id), Some(keys)) = (self.peer_id, self.keys.clone()) else {
            return Err(self.invalid("confirmed sent"));
        };
        self.state = OutboundState::Complete;
        debug!(peer = %self.remote, %peer_id, "outbound handshake complete");
        Ok(EstablishedSession {
            remote: self.remote,
            role: Role::Initiator,
            peer_id,
            keys,
            established_ms: now_ms,
            queued: self.queued.drain(),
            confirmation: std::mem::take(&mut self.confirmation),
        })
    }

    pub fn queue_message(&mut self, msg: QueuedMessage) -> Result<bool, HandshakeError> {
        self.check_live()?;
        self.queued.push(msg)
    }

    pub fn take_queued(&mut self) -> Vec<QueuedMessage> {
        self.queued.drain()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.queue.len()
    }
}

impl fmt::Debug for OutboundHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundHandshake")
            .field("remote", &self.remote)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("started_ms", &self.started_ms)
            .field("schedule", &self.schedule)
            .field("token", &self.token)
            .field("queued", &self.queued.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    // ─── Test crypto ────────────────────────────────────────────────────────

    fn digest(parts: &[&[u8]]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for (i, slot) in out.iter_mut().enumerate() {
            for part in parts {
                for b in part.iter() {
                    h ^= *b as u64;
                    h = h.wrapping_mul(0x0100_0000_01b3);
                }
            }
            h ^= i as u64;
            *slot = (h >> 24) as u8;
        }
        out
    }

    struct TestKx(Bytes);

    impl KeyExchange for TestKx {
        fn public_key(&self) -> Bytes {
            self.0.clone()
        }

        fn complete(self: Box<Self>, peer: &[u8]) -> Result<SessionKeys, CryptoFailure> {
            let key: Vec<u8> = self.0.iter().zip(peer).map(|(a, b)| a ^ b).collect();
            Ok(SessionKeys {
                cipher_key: Bytes::from(key.clone()),
                mac_key: Bytes::from(key),
            })
        }
    }

    struct TestCrypto {
        identity: Bytes,
        next_key: AtomicU8,
    }

    impl TestCrypto {
        fn new(name: &str) -> Self {
            TestCrypto {
                identity: Bytes::copy_from_slice(name.as_bytes()),
                next_key: AtomicU8::new(1),
            }
        }
    }

    impl CryptoService for TestCrypto {
        fn key_exchange(&self) -> Result<Box<dyn KeyExchange>, CryptoFailure> {
            let seed = self.next_key.fetch_add(1, Ordering::Relaxed);
            let public = digest(&[&self.identity[..], &[seed][..]]);
            Ok(Box::new(TestKx(Bytes::copy_from_slice(&public))))
        }

        fn local_identity(&self) -> Bytes {
            self.identity.clone()
        }

        fn sign(&self, data: &[u8]) -> Result<Bytes, CryptoFailure> {
            let mut sig = digest(&[&self.identity[..]]).to_vec();
            sig.extend_from_slice(&digest(&[&self.identity[..], data]));
            Ok(Bytes::from(sig))
        }

        fn verify_identity(
            &self,
            identity: &[u8],
            data: &[u8],
            signature: &[u8],
        ) -> Result<PeerId, CryptoFailure> {
            let mut expected = digest(&[identity]).to_vec();
            expected.extend_from_slice(&digest(&[identity, data]));
            if expected == signature {
                Ok(PeerId(digest(&[identity])))
            } else {
                Err(CryptoFailure::new("bad signature"))
            }
        }

        fn seal(&self, _: Option<&SessionKeys>, plaintext: &[u8]) -> Result<Bytes, CryptoFailure> {
            Ok(Bytes::copy_from_slice(plaintext))
        }

        fn open(&self, _: Option<&SessionKeys>, datagram: &[u8]) -> Result<Bytes, CryptoFailure> {
            Ok(Bytes::copy_from_slice(datagram))
        }
    }

    fn alice_addr() -> RemoteHostId {
        RemoteHostId::new("10.0.0.1".parse().unwrap(), 4000)
    }

    fn bob_addr() -> RemoteHostId {
        RemoteHostId::new("10.0.0.2".parse().unwrap(), 5000)
    }

    fn msg(handle: u64) -> QueuedMessage {
        QueuedMessage {
            handle,
            payload: Bytes::from(vec![handle as u8; 4]),
        }
    }

    /// Run the v1 exchange up to the responder holding a full confirmation.
    fn run_to_confirmed(
        alice: &TestCrypto,
        bob: &TestCrypto,
    ) -> (OutboundHandshake, InboundHandshake) {
        let mut out = OutboundHandshake::new(
            bob_addr(),
            bob.local_identity(),
            ProtocolVersion::V1,
            None,
            0,
        );
        let mut inb = InboundHandshake::new(alice_addr(), bob_addr().port, ProtocolVersion::V1, 0);

        let req = out.prepare_request(alice).unwrap();
        out.request_sent(0).unwrap();
        inb.receive_session_request(&req, TokenCheck::NotRequired, 10).unwrap();
        assert_eq!(inb.state(), InboundState::RequestReceived);

        let created = inb.prepare_created(bob, 0, 100).unwrap();
        inb.created_packet_sent(10).unwrap();
        out.receive_session_created(&created, alice, 20).unwrap();
        assert_eq!(out.state(), OutboundState::CreatedReceived);

        for frag in out.prepare_confirmed(alice, 101).unwrap() {
            inb.receive_session_confirmed(&frag, 30).unwrap();
        }
        (out, inb)
    }

    // ─── Backoff Tests ──────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let delays: Vec<u64> = (0..6).map(backoff_delay).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 15_000, 15_000]);
        assert_eq!(backoff_delay(63), MAX_DELAY_MS);
    }

    #[test]
    fn created_retransmissions_follow_backoff() {
        let bob = TestCrypto::new("bob");
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        let req = SessionRequest {
            ephemeral_key: Bytes::from(vec![7u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        inb.receive_session_request(&req, TokenCheck::NotRequired, 0).unwrap();
        inb.prepare_created(&bob, 0, 0).unwrap();

        let mut now = 0;
        let mut delays = Vec::new();
        for _ in 0..5 {
            let d = inb.created_packet_sent(now).unwrap();
            assert_eq!(inb.next_send_ms(), now + d);
            delays.push(d);
            now += d;
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 15_000]);
        assert_eq!(inb.state(), InboundState::CreatedSent);
    }

    // ─── Responder Tests ────────────────────────────────────────────────────

    #[test]
    fn full_exchange_completes_both_sides() {
        let alice = TestCrypto::new("alice");
        let bob = TestCrypto::new("bob");
        let (mut out, mut inb) = run_to_confirmed(&alice, &bob);
        assert_eq!(inb.state(), InboundState::ConfirmedCompletely);

        inb.queue_message(msg(1)).unwrap();
        let established = inb.verify_identity(&bob, 40).unwrap();
        assert_eq!(inb.state(), InboundState::Complete);
        assert!(inb.is_complete());
        assert_eq!(established.role, Role::Responder);
        assert_eq!(established.queued, vec![msg(1)]);
        assert_eq!(established.peer_id, PeerId(digest(&[&b"alice"[..]])));

        let initiator = out.confirmed_sent(40).unwrap();
        assert_eq!(initiator.peer_id, PeerId(digest(&[&b"bob"[..]])));
        assert_eq!(initiator.keys, established.keys, "both sides agree on keys");
        assert_eq!(initiator.confirmation.len(), 1);
    }

    #[test]
    fn first_copy_of_request_fields_is_kept() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        let first = SessionRequest {
            ephemeral_key: Bytes::from(vec![1u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        inb.receive_session_request(&first, TokenCheck::NotRequired, 0).unwrap();
        let second = SessionRequest {
            ephemeral_key: Bytes::from(vec![2u8; KEY_SIZE]),
            ..first.clone()
        };
        inb.receive_session_request(&second, TokenCheck::NotRequired, 50).unwrap();
        assert_eq!(inb.peer_ephemeral.as_deref(), Some(&[1u8; KEY_SIZE][..]));
        assert_eq!(inb.next_send_ms(), 50, "inbound packet makes action due");
    }

    #[test]
    fn short_ephemeral_key_is_malformed() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        let req = SessionRequest {
            ephemeral_key: Bytes::from_static(b"short"),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        assert_eq!(
            inb.receive_session_request(&req, TokenCheck::NotRequired, 0),
            Err(HandshakeError::Malformed("ephemeral key size"))
        );
        assert_eq!(inb.state(), InboundState::Unknown);
    }

    #[test]
    fn bad_signature_fails_handshake() {
        let alice = TestCrypto::new("alice");
        let bob = TestCrypto::new("bob");
        let (_, mut inb) = run_to_confirmed(&alice, &bob);
        // Corrupt the stored signature.
        if let Some(sig) = inb.confirm_signature.as_mut() {
            sig.signature = Bytes::from(vec![0u8; SIGNATURE_SIZE]);
        }
        assert_eq!(
            inb.verify_identity(&bob, 40).unwrap_err(),
            HandshakeError::Failed(FailureReason::SignatureInvalid)
        );
        assert_eq!(inb.state(), InboundState::Failed);
        assert!(inb.is_complete());
        assert!(matches!(
            inb.verify_identity(&bob, 41),
            Err(HandshakeError::Failed(_))
        ));
    }

    #[test]
    fn confirmation_fragments_accumulate() {
        let bob = TestCrypto::new("bob");
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        let req = SessionRequest {
            ephemeral_key: Bytes::from(vec![7u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        inb.receive_session_request(&req, TokenCheck::NotRequired, 0).unwrap();
        inb.prepare_created(&bob, 0, 0).unwrap();
        inb.created_packet_sent(0).unwrap();

        let part = |index: u8, total: u8, sig: bool| SessionConfirmed {
            index,
            total,
            identity_fragment: Bytes::from(vec![index; 3]),
            signature: sig.then(|| ConfirmSignature {
                signed_on: 1,
                signature: Bytes::from(vec![1u8; SIGNATURE_SIZE]),
            }),
        };
        inb.receive_session_confirmed(&part(2, 3, true), 5).unwrap();
        assert_eq!(inb.state(), InboundState::ConfirmedPartially);
        assert_eq!(
            inb.receive_session_confirmed(&part(0, 4, false), 6),
            Err(HandshakeError::Malformed("confirm fragment total changed"))
        );
        assert_eq!(
            inb.receive_session_confirmed(&part(3, 3, false), 6),
            Err(HandshakeError::Malformed("confirm fragment index"))
        );
        assert_eq!(inb.state(), InboundState::ConfirmedPartially, "malformed input does not fail");
        inb.receive_session_confirmed(&part(0, 3, false), 7).unwrap();
        inb.receive_session_confirmed(&part(1, 3, false), 8).unwrap();
        assert_eq!(inb.state(), InboundState::ConfirmedCompletely);
    }

    #[test]
    fn partial_confirmation_keeps_created_schedule() {
        let bob = TestCrypto::new("bob");
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        let req = SessionRequest {
            ephemeral_key: Bytes::from(vec![7u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        inb.receive_session_request(&req, TokenCheck::NotRequired, 0).unwrap();
        let created = inb.prepare_created(&bob, 0, 0).unwrap();
        let delay = inb.created_packet_sent(0).unwrap();
        assert!(delay > 0);

        let first = SessionConfirmed {
            index: 0,
            total: 2,
            identity_fragment: Bytes::from_static(b"abc"),
            signature: None,
        };
        inb.receive_session_confirmed(&first, 10).unwrap();
        assert_eq!(inb.state(), InboundState::ConfirmedPartially);
        assert_eq!(inb.next_send_ms(), delay, "not due on every sweep");

        // the rest never arrives: SessionCreated is resent unchanged
        assert_eq!(inb.prepare_created(&bob, 0, 0).unwrap(), created);
        let next = inb.created_packet_sent(delay).unwrap();
        assert!(next >= delay);
        assert_eq!(inb.state(), InboundState::ConfirmedPartially);
        assert_eq!(inb.next_send_ms(), delay + next);

        let last = SessionConfirmed {
            index: 1,
            total: 2,
            identity_fragment: Bytes::from_static(b"def"),
            signature: Some(ConfirmSignature {
                signed_on: 1,
                signature: Bytes::from(vec![1u8; SIGNATURE_SIZE]),
            }),
        };
        inb.receive_session_confirmed(&last, delay + 5).unwrap();
        assert_eq!(inb.state(), InboundState::ConfirmedCompletely);
        assert_eq!(inb.next_send_ms(), delay + 5);
    }

    #[test]
    fn terminal_states_ignore_input() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        inb.fail(FailureReason::Timeout);
        let req = SessionRequest {
            ephemeral_key: Bytes::from(vec![7u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        assert!(inb.receive_session_request(&req, TokenCheck::NotRequired, 0).is_err());
        assert_eq!(inb.state(), InboundState::Failed);
        inb.fail(FailureReason::Destroyed);
        assert_eq!(inb.failure(), Some(&FailureReason::Timeout));
    }

    #[test]
    fn pending_queue_dedups_and_bounds() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        assert_eq!(inb.queue_message(msg(1)), Ok(true));
        assert_eq!(inb.queue_message(msg(1)), Ok(false));
        for h in 2..=MAX_QUEUED_PER_PEER as u64 {
            inb.queue_message(msg(h)).unwrap();
        }
        assert_eq!(
            inb.queue_message(msg(99)),
            Err(HandshakeError::QueueFull(MAX_QUEUED_PER_PEER))
        );
        let drained = inb.take_queued();
        assert_eq!(drained.first(), Some(&msg(1)));
        assert_eq!(drained.len(), MAX_QUEUED_PER_PEER);
    }

    #[test]
    fn lifetime_bound() {
        let inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 1_000);
        assert!(!inb.is_timed_out(13_000));
        assert!(inb.is_timed_out(13_001));
    }

    // ─── Token Tests ────────────────────────────────────────────────────────

    #[test]
    fn v2_token_request_then_retry_then_request() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V2, 0);
        inb.receive_token_request(0xABCD, 0).unwrap();
        assert_eq!(inb.state(), InboundState::TokenRequestReceived);
        assert_eq!(inb.retry_token(), Some(0xABCD));
        inb.retry_packet_sent(10).unwrap();
        assert_eq!(inb.state(), InboundState::RetrySent);
        assert_eq!(inb.next_send_ms(), 10 + RETRY_WINDOW_MS);

        let req = SessionRequest {
            ephemeral_key: Bytes::from(vec![7u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0xABCD,
        };
        inb.receive_session_request(&req, TokenCheck::Valid, 20).unwrap();
        assert_eq!(inb.state(), InboundState::RequestReceived);
        assert_eq!(inb.accepted_token(), Some(0xABCD));

        // A retransmitted request with the same token is fine.
        inb.receive_session_request(&req, TokenCheck::Invalid, 30).unwrap();
        assert_eq!(inb.state(), InboundState::RequestReceived);
    }

    #[test]
    fn v2_missing_token_asks_for_retry() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V2, 0);
        let req = SessionRequest {
            ephemeral_key: Bytes::from(vec![7u8; KEY_SIZE]),
            observed_ip: bob_addr().ip,
            token: 0,
        };
        inb.receive_session_request(&req, TokenCheck::Invalid, 0).unwrap();
        assert_eq!(inb.state(), InboundState::RequestBadTokenReceived);
        inb.set_retry_token(5);
        inb.retry_packet_sent(1).unwrap();

        assert_eq!(
            inb.receive_session_request(&req, TokenCheck::Invalid, 2),
            Err(HandshakeError::Failed(FailureReason::TokenMismatch))
        );
        assert_eq!(inb.state(), InboundState::Failed);
    }

    #[test]
    fn retry_sent_expires_after_window() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V2, 0);
        inb.receive_token_request(1, 0).unwrap();
        inb.retry_packet_sent(0).unwrap();
        assert!(!inb.is_timed_out(RETRY_WINDOW_MS));
        assert!(inb.is_timed_out(RETRY_WINDOW_MS + 1));
    }

    #[test]
    fn token_request_rejected_on_v1() {
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        assert!(matches!(
            inb.receive_token_request(1, 0),
            Err(HandshakeError::InvalidState { .. })
        ));
    }

    // ─── Initiator Tests ────────────────────────────────────────────────────

    #[test]
    fn initiator_v2_starts_with_token_request() {
        let alice = TestCrypto::new("alice");
        let mut out =
            OutboundHandshake::new(bob_addr(), Bytes::from_static(b"bob"), ProtocolVersion::V2, None, 0);
        assert_eq!(out.next_action(), OutboundAction::TokenRequest);
        assert_eq!(out.token_request_sent(0).unwrap(), 1_000);
        assert_eq!(out.token_request_sent(1_000).unwrap(), 2_000);

        out.receive_retry(77, 1_500).unwrap();
        assert_eq!(out.state(), OutboundState::RetryReceived);
        assert_eq!(out.next_send_ms(), 1_500);
        assert_eq!(out.next_action(), OutboundAction::SessionRequest);
        let req = out.prepare_request(&alice).unwrap();
        assert_eq!(req.token, 77);
        assert_eq!(req.observed_ip, bob_addr().ip);
        assert_eq!(out.request_sent(1_500).unwrap(), 1_000);
    }

    #[test]
    fn initiator_with_known_token_skips_token_request() {
        let out = OutboundHandshake::new(
            bob_addr(),
            Bytes::from_static(b"bob"),
            ProtocolVersion::V2,
            Some(9),
            0,
        );
        assert_eq!(out.next_action(), OutboundAction::SessionRequest);
    }

    #[test]
    fn initiator_rejects_forged_created() {
        let alice = TestCrypto::new("alice");
        let bob = TestCrypto::new("bob");
        let mallory = TestCrypto::new("mallory");
        let mut out =
            OutboundHandshake::new(bob_addr(), bob.local_identity(), ProtocolVersion::V1, None, 0);
        let mut inb = InboundHandshake::new(alice_addr(), 5000, ProtocolVersion::V1, 0);
        let req = out.prepare_request(&alice).unwrap();
        out.request_sent(0).unwrap();
        inb.receive_session_request(&req, TokenCheck::NotRequired, 0).unwrap();
        let created = inb.prepare_created(&mallory, 0, 0).unwrap();

        assert_eq!(
            out.receive_session_created(&created, &alice, 10),
            Err(HandshakeError::Failed(FailureReason::SignatureInvalid))
        );
        assert_eq!(out.state(), OutboundState::Failed);
    }

    #[test]
    fn large_identity_spans_confirm_fragments() {
        let alice = TestCrypto {
            identity: Bytes::from(vec![0x5A; CONFIRM_FRAGMENT_SIZE * 2 + 10]),
            next_key: AtomicU8::new(1),
        };
        let bob = TestCrypto::new("bob");
        let (_, mut inb) = run_to_confirmed(&alice, &bob);
        assert_eq!(inb.confirm_fragments.len(), 3);
        let established = inb.verify_identity(&bob, 50).unwrap();
        assert_eq!(
            established.peer_id,
            PeerId(digest(&[&vec![0x5A; CONFIRM_FRAGMENT_SIZE * 2 + 10][..]]))
        );
    }
}
