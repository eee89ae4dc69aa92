//! # Skiff Wire Format
//!
//! Plaintext layout of every datagram after the crypto service has stripped
//! the 16-byte MAC and 16-byte IV.
//!
//! ## Header (5 bytes)
//!
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | type  |R|E|0 0|              Send time (seconds, 32-bit)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## Data payload
//!
//! ```text
//! flags (1)  [bit 7: explicit ACKs, bit 6: ACK bitfields]
//! [count (1) + count × message id (4)]
//! [count (1) + count × (message id (4) + 7-bit groups, 0x80 = more)]
//! fragment count (1)
//! per fragment: message id (4) | index << 1 | last (1) | size & 0x3FFF (2) | payload
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ack::AckBitfield;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Flag byte + 4-byte send time.
pub const HEADER_SIZE: usize = 5;

/// MAC and IV prepended by the crypto service when sealing.
pub const MAC_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

/// Ephemeral public key length carried in session request/created.
pub const KEY_SIZE: usize = 32;

/// Signature length carried in session created/confirmed.
pub const SIGNATURE_SIZE: usize = 64;

/// Message id (4) + fragment info (3).
pub const FRAGMENT_HEADER_SIZE: usize = 7;

/// The fragment size field is 14 bits wide.
pub const MAX_FRAGMENT_PAYLOAD: usize = 0x3FFF;

/// Every count on the wire is a single byte.
pub const MAX_WIRE_COUNT: usize = u8::MAX as usize;

/// Bitfields longer than this cannot describe a message we would accept.
pub const MAX_BITFIELD_BYTES: usize = 5;

const DATA_FLAG_EXPLICIT_ACKS: u8 = 1 << 7;
const DATA_FLAG_ACK_BITFIELDS: u8 = 1 << 6;
const BITFIELD_CONTINUATION: u8 = 0x80;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unknown payload type {0}")]
    UnknownPayloadType(u8),
    #[error("invalid {0}")]
    InvalidField(&'static str),
    #[error("too many {0} for a one-byte count")]
    CountOverflow(&'static str),
}

fn need(buf: &Bytes, len: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated(what))
    } else {
        Ok(())
    }
}

// ─── PayloadType ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    SessionRequest = 0,
    SessionCreated = 1,
    SessionConfirmed = 2,
    Data = 6,
    SessionDestroyed = 8,
    Retry = 9,
    TokenRequest = 10,
}

impl PayloadType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PayloadType::SessionRequest),
            1 => Some(PayloadType::SessionCreated),
            2 => Some(PayloadType::SessionConfirmed),
            6 => Some(PayloadType::Data),
            8 => Some(PayloadType::SessionDestroyed),
            9 => Some(PayloadType::Retry),
            10 => Some(PayloadType::TokenRequest),
            _ => None,
        }
    }

    /// Handshake traffic, as opposed to session traffic.
    pub fn is_establishment(self) -> bool {
        matches!(
            self,
            PayloadType::SessionRequest
                | PayloadType::SessionCreated
                | PayloadType::SessionConfirmed
                | PayloadType::Retry
                | PayloadType::TokenRequest
        )
    }
}

// ─── PacketHeader ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_type: PayloadType,
    pub rekey: bool,
    pub extended_options: bool,
    pub time_secs: u32,
}

impl PacketHeader {
    pub fn new(payload_type: PayloadType, time_secs: u32) -> Self {
        PacketHeader {
            payload_type,
            rekey: false,
            extended_options: false,
            time_secs,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flag = (self.payload_type as u8) << 4;
        if self.rekey {
            flag |= 1 << 3;
        }
        if self.extended_options {
            flag |= 1 << 2;
        }
        buf.put_u8(flag);
        buf.put_u32(self.time_secs);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, HEADER_SIZE, "header")?;
        let flag = buf.get_u8();
        let raw_type = flag >> 4;
        let payload_type =
            PayloadType::from_u8(raw_type).ok_or(WireError::UnknownPayloadType(raw_type))?;
        let time_secs = buf.get_u32();
        Ok(PacketHeader {
            payload_type,
            rekey: flag & (1 << 3) != 0,
            extended_options: flag & (1 << 2) != 0,
            time_secs,
        })
    }
}

// ─── Addresses ──────────────────────────────────────────────────────────────

fn encode_ip(ip: &IpAddr, buf: &mut impl BufMut) {
    match ip {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
}

fn decode_ip(buf: &mut Bytes) -> Result<IpAddr, WireError> {
    need(buf, 1, "ip size")?;
    let size = buf.get_u8() as usize;
    need(buf, size, "ip")?;
    match size {
        4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(WireError::InvalidField("ip size")),
    }
}

/// Byte form used when building signed handshake data.
pub fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

// ─── Handshake payloads ─────────────────────────────────────────────────────

/// First initiator message: ephemeral key X, the responder's IP as the
/// initiator sees it, and (protocol version 2) the retry token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub ephemeral_key: Bytes,
    pub observed_ip: IpAddr,
    pub token: u64,
}

impl SessionRequest {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.ephemeral_key);
        encode_ip(&self.observed_ip, buf);
        buf.put_u64(self.token);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, KEY_SIZE, "ephemeral key")?;
        let ephemeral_key = buf.split_to(KEY_SIZE);
        let observed_ip = decode_ip(buf)?;
        need(buf, 8, "token")?;
        let token = buf.get_u64();
        Ok(SessionRequest {
            ephemeral_key,
            observed_ip,
            token,
        })
    }
}

/// Responder reply: ephemeral key Y, the initiator's address as seen by the
/// responder, and the responder's signature over the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreated {
    pub ephemeral_key: Bytes,
    pub alice_ip: IpAddr,
    pub alice_port: u16,
    pub relay_tag: u32,
    pub signed_on: u32,
    pub signature: Bytes,
}

impl SessionCreated {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.ephemeral_key);
        encode_ip(&self.alice_ip, buf);
        buf.put_u16(self.alice_port);
        buf.put_u32(self.relay_tag);
        buf.put_u32(self.signed_on);
        buf.put_slice(&self.signature);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, KEY_SIZE, "ephemeral key")?;
        let ephemeral_key = buf.split_to(KEY_SIZE);
        let alice_ip = decode_ip(buf)?;
        need(buf, 2 + 4 + 4 + SIGNATURE_SIZE, "session created")?;
        let alice_port = buf.get_u16();
        let relay_tag = buf.get_u32();
        let signed_on = buf.get_u32();
        let signature = buf.split_to(SIGNATURE_SIZE);
        Ok(SessionCreated {
            ephemeral_key,
            alice_ip,
            alice_port,
            relay_tag,
            signed_on,
            signature,
        })
    }
}

/// One fragment of the initiator's identity. The final fragment
/// (`index == total - 1`) carries the signed-on time and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfirmed {
    pub index: u8,
    pub total: u8,
    pub identity_fragment: Bytes,
    pub signature: Option<ConfirmSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmSignature {
    pub signed_on: u32,
    pub signature: Bytes,
}

impl SessionConfirmed {
    /// Index and total share one byte, four bits each.
    pub const MAX_FRAGMENTS: u8 = 15;

    pub fn is_final(&self) -> bool {
        self.total > 0 && self.index == self.total - 1
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), WireError> {
        if self.total == 0 || self.total > Self::MAX_FRAGMENTS || self.index >= self.total {
            return Err(WireError::InvalidField("confirm fragment info"));
        }
        if self.identity_fragment.len() > u16::MAX as usize {
            return Err(WireError::InvalidField("confirm fragment size"));
        }
        buf.put_u8((self.index << 4) | self.total);
        buf.put_u16(self.identity_fragment.len() as u16);
        buf.put_slice(&self.identity_fragment);
        if self.is_final() {
            let sig = self
                .signature
                .as_ref()
                .ok_or(WireError::InvalidField("missing confirm signature"))?;
            buf.put_u32(sig.signed_on);
            buf.put_slice(&sig.signature);
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 3, "confirm fragment info")?;
        let info = buf.get_u8();
        let index = info >> 4;
        let total = info & 0x0F;
        if total == 0 {
            return Err(WireError::InvalidField("confirm fragment total"));
        }
        let size = buf.get_u16() as usize;
        need(buf, size, "identity fragment")?;
        let identity_fragment = buf.split_to(size);
        let mut confirmed = SessionConfirmed {
            index,
            total,
            identity_fragment,
            signature: None,
        };
        if confirmed.is_final() {
            need(buf, 4 + SIGNATURE_SIZE, "confirm signature")?;
            let signed_on = buf.get_u32();
            let signature = buf.split_to(SIGNATURE_SIZE);
            confirmed.signature = Some(ConfirmSignature {
                signed_on,
                signature,
            });
        }
        Ok(confirmed)
    }
}

// ─── Data payload ───────────────────────────────────────────────────────────

/// One fragment of an application message as carried in a data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentFrame {
    pub message_id: u32,
    pub index: u8,
    pub is_last: bool,
    pub payload: Bytes,
}

impl FragmentFrame {
    pub fn encoded_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), WireError> {
        if self.index > 0x7F {
            return Err(WireError::InvalidField("fragment index"));
        }
        if self.payload.len() > MAX_FRAGMENT_PAYLOAD {
            return Err(WireError::InvalidField("fragment size"));
        }
        buf.put_u32(self.message_id);
        buf.put_u8((self.index << 1) | self.is_last as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, FRAGMENT_HEADER_SIZE, "fragment header")?;
        let message_id = buf.get_u32();
        let info = buf.get_u8();
        let size = (buf.get_u16() as usize) & MAX_FRAGMENT_PAYLOAD;
        need(buf, size, "fragment payload")?;
        Ok(FragmentFrame {
            message_id,
            index: info >> 1,
            is_last: info & 1 == 1,
            payload: buf.split_to(size),
        })
    }
}

fn encode_bitfield(ack: &AckBitfield, buf: &mut impl BufMut) {
    buf.put_u32(ack.message_id());
    let count = ack.fragment_count().max(1) as usize;
    let groups = count.div_ceil(7);
    let mask = ack.mask();
    for group in 0..groups {
        let mut byte = ((mask >> (group * 7)) & 0x7F) as u8;
        if group + 1 < groups {
            byte |= BITFIELD_CONTINUATION;
        }
        buf.put_u8(byte);
    }
}

fn decode_bitfield(buf: &mut Bytes) -> Result<AckBitfield, WireError> {
    need(buf, 4, "bitfield message id")?;
    let message_id = buf.get_u32();
    let mut mask = 0u64;
    let mut groups = 0usize;
    loop {
        need(buf, 1, "bitfield")?;
        if groups == MAX_BITFIELD_BYTES {
            return Err(WireError::InvalidField("bitfield length"));
        }
        let byte = buf.get_u8();
        mask |= ((byte & 0x7F) as u64) << (groups * 7);
        groups += 1;
        if byte & BITFIELD_CONTINUATION == 0 {
            break;
        }
    }
    Ok(AckBitfield::partial(message_id, (groups * 7) as u8, mask))
}

/// Acknowledgments and fragments carried in one data packet.
///
/// Fully received messages travel as explicit 4-byte ACKs; partially received
/// ones travel as bitfields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataPacket {
    pub acks: Vec<AckBitfield>,
    pub fragments: Vec<FragmentFrame>,
}

impl DataPacket {
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + 1;
        let (full, partial): (Vec<&AckBitfield>, Vec<&AckBitfield>) =
            self.acks.iter().partition(|a| a.received_complete());
        if !full.is_empty() {
            len += 1 + 4 * full.len();
        }
        if !partial.is_empty() {
            len += 1;
            for ack in partial {
                len += 4 + (ack.fragment_count().max(1) as usize).div_ceil(7);
            }
        }
        len + self.fragments.iter().map(FragmentFrame::encoded_len).sum::<usize>()
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), WireError> {
        let (full, partial): (Vec<&AckBitfield>, Vec<&AckBitfield>) =
            self.acks.iter().partition(|a| a.received_complete());
        if full.len() > MAX_WIRE_COUNT {
            return Err(WireError::CountOverflow("explicit acks"));
        }
        if partial.len() > MAX_WIRE_COUNT {
            return Err(WireError::CountOverflow("ack bitfields"));
        }
        if self.fragments.len() > MAX_WIRE_COUNT {
            return Err(WireError::CountOverflow("fragments"));
        }

        let mut flags = 0u8;
        if !full.is_empty() {
            flags |= DATA_FLAG_EXPLICIT_ACKS;
        }
        if !partial.is_empty() {
            flags |= DATA_FLAG_ACK_BITFIELDS;
        }
        buf.put_u8(flags);
        if !full.is_empty() {
            buf.put_u8(full.len() as u8);
            for ack in &full {
                buf.put_u32(ack.message_id());
            }
        }
        if !partial.is_empty() {
            buf.put_u8(partial.len() as u8);
            for ack in &partial {
                encode_bitfield(ack, buf);
            }
        }
        buf.put_u8(self.fragments.len() as u8);
        for frame in &self.fragments {
            frame.encode(buf)?;
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 1, "data flags")?;
        let flags = buf.get_u8();
        let mut acks = Vec::new();

        if flags & DATA_FLAG_EXPLICIT_ACKS != 0 {
            need(buf, 1, "ack count")?;
            let count = buf.get_u8() as usize;
            need(buf, count * 4, "explicit acks")?;
            for _ in 0..count {
                acks.push(AckBitfield::fully_received(buf.get_u32(), 0));
            }
        }
        if flags & DATA_FLAG_ACK_BITFIELDS != 0 {
            need(buf, 1, "bitfield count")?;
            let count = buf.get_u8() as usize;
            for _ in 0..count {
                acks.push(decode_bitfield(buf)?);
            }
        }

        need(buf, 1, "fragment count")?;
        let count = buf.get_u8() as usize;
        let mut fragments = Vec::with_capacity(count);
        for _ in 0..count {
            fragments.push(FragmentFrame::decode(buf)?);
        }
        Ok(DataPacket { acks, fragments })
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    SessionRequest(SessionRequest),
    SessionCreated(SessionCreated),
    SessionConfirmed(SessionConfirmed),
    Data(DataPacket),
    SessionDestroyed { reason: u8 },
    Retry { token: u64 },
    TokenRequest,
}

impl Packet {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Packet::SessionRequest(_) => PayloadType::SessionRequest,
            Packet::SessionCreated(_) => PayloadType::SessionCreated,
            Packet::SessionConfirmed(_) => PayloadType::SessionConfirmed,
            Packet::Data(_) => PayloadType::Data,
            Packet::SessionDestroyed { .. } => PayloadType::SessionDestroyed,
            Packet::Retry { .. } => PayloadType::Retry,
            Packet::TokenRequest => PayloadType::TokenRequest,
        }
    }

    /// Encode header and payload into one plaintext buffer.
    pub fn encode(&self, time_secs: u32) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 128);
        PacketHeader::new(self.payload_type(), time_secs).encode(&mut buf);
        match self {
            Packet::SessionRequest(p) => p.encode(&mut buf),
            Packet::SessionCreated(p) => p.encode(&mut buf),
            Packet::SessionConfirmed(p) => p.encode(&mut buf)?,
            Packet::Data(p) => {
                buf.reserve(p.encoded_len());
                p.encode(&mut buf)?
            }
            Packet::SessionDestroyed { reason } => buf.put_u8(*reason),
            Packet::Retry { token } => buf.put_u64(*token),
            Packet::TokenRequest => {}
        }
        Ok(buf.freeze())
    }

    /// Decode a plaintext buffer. Trailing bytes are ignored.
    pub fn decode(mut buf: Bytes) -> Result<(PacketHeader, Packet), WireError> {
        let header = PacketHeader::decode(&mut buf)?;
        let packet = match header.payload_type {
            PayloadType::SessionRequest => Packet::SessionRequest(SessionRequest::decode(&mut buf)?),
            PayloadType::SessionCreated => Packet::SessionCreated(SessionCreated::decode(&mut buf)?),
            PayloadType::SessionConfirmed => {
                Packet::SessionConfirmed(SessionConfirmed::decode(&mut buf)?)
            }
            PayloadType::Data => Packet::Data(DataPacket::decode(&mut buf)?),
            PayloadType::SessionDestroyed => {
                need(&buf, 1, "destroy reason")?;
                Packet::SessionDestroyed {
                    reason: buf.get_u8(),
                }
            }
            PayloadType::Retry => {
                need(&buf, 8, "retry token")?;
                Packet::Retry {
                    token: buf.get_u64(),
                }
            }
            PayloadType::TokenRequest => Packet::TokenRequest,
        };
        Ok((header, packet))
    }
}
