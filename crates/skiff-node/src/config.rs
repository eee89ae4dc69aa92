//! # Endpoint Configuration
//!
//! Parsed from TOML into an `*Input` tree where every field is optional, then
//! resolved into a validated [`NodeConfig`]: unknown versions rejected,
//! missing values defaulted, sizes clamped to what the wire format and the
//! MTU allow.
//!
//! ```toml
//! version = 1
//! bind = "0.0.0.0:4500"
//! protocol_version = 2
//! mtu = 1484
//!
//! [transport]
//! fragment_size = 1024
//! max_in_flight = 256
//!
//! [pool]
//! capacity = 4096
//! ```

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use skiff_transport::ack::ACK_FREQUENCY_MS;
use skiff_transport::establish::{EstablishConfig, MAX_CONCURRENT_ESTABLISHMENTS, TOKEN_LIFETIME_MS};
use skiff_transport::handshake::ProtocolVersion;
use skiff_transport::outbound::{
    OutboundConfig, DEFAULT_FRAGMENT_SIZE, DEFAULT_MAX_IN_FLIGHT, MAX_SENDS, MESSAGE_LIFETIME_MS,
};
use skiff_transport::pool::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};
use skiff_transport::reassembly::{
    ReassemblyConfig, MAX_INBOUND_MESSAGES, MESSAGE_EXPIRY_MS, RECENTLY_COMPLETED_CAPACITY,
};
use skiff_transport::wire::{FRAGMENT_HEADER_SIZE, HEADER_SIZE, IV_SIZE, MAC_SIZE, MAX_FRAGMENT_PAYLOAD};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_MTU: usize = 1_484;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9_000;

/// IPv4 + UDP headers.
const IP_UDP_OVERHEAD: usize = 28;

/// Data packet bytes around a single fragment: flags, fragment count.
const DATA_OVERHEAD: usize = 2;

const MIN_FRAGMENT_SIZE: usize = 64;

pub const DEFAULT_DELIVERY_CAPACITY: usize = 1_024;

// ─── Input ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigInput {
    pub version: u32,
    pub bind: Option<String>,
    pub protocol_version: Option<u8>,
    pub mtu: Option<usize>,
    pub transport: TransportConfigInput,
    pub reassembly: ReassemblyConfigInput,
    pub pool: PoolConfigInput,
    pub handshake: HandshakeConfigInput,
    pub acks: AckConfigInput,
    pub delivery: DeliveryConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub fragment_size: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub max_sends: Option<u8>,
    pub message_lifetime_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfigInput {
    pub expiry_ms: Option<u64>,
    pub max_messages: Option<usize>,
    pub recently_completed: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolConfigInput {
    pub capacity: Option<usize>,
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HandshakeConfigInput {
    pub max_concurrent: Option<usize>,
    pub token_lifetime_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AckConfigInput {
    pub min_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryConfigInput {
    pub queue_capacity: Option<usize>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub capacity: usize,
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: DEFAULT_POOL_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub version: u32,
    pub bind: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub mtu: usize,
    pub outbound: OutboundConfig,
    pub reassembly: ReassemblyConfig,
    pub pool: PoolConfig,
    pub max_concurrent_handshakes: usize,
    pub token_lifetime_ms: u64,
    pub ack_interval_ms: u64,
    pub delivery_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            version: CONFIG_VERSION,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            protocol_version: ProtocolVersion::V1,
            mtu: DEFAULT_MTU,
            outbound: OutboundConfig::default(),
            reassembly: ReassemblyConfig::default(),
            pool: PoolConfig::default(),
            max_concurrent_handshakes: MAX_CONCURRENT_ESTABLISHMENTS,
            token_lifetime_ms: TOKEN_LIFETIME_MS,
            ack_interval_ms: ACK_FREQUENCY_MS,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

/// Largest plaintext packet that fits one datagram of `mtu` once sealed.
pub fn max_packet_size(mtu: usize) -> usize {
    mtu.saturating_sub(IP_UDP_OVERHEAD + MAC_SIZE + IV_SIZE)
}

/// Largest fragment payload that fits a data packet of `mtu` on its own.
pub fn max_fragment_size(mtu: usize) -> usize {
    max_packet_size(mtu)
        .saturating_sub(HEADER_SIZE + DATA_OVERHEAD + FRAGMENT_HEADER_SIZE)
        .min(MAX_FRAGMENT_PAYLOAD)
}

impl NodeConfigInput {
    pub fn resolve(self) -> Result<NodeConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("unsupported config version {version}");
        }

        let defaults = NodeConfig::default();
        let bind = match self.bind.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid bind address {s:?}"))?,
            _ => defaults.bind,
        };
        let protocol_version = match self.protocol_version {
            None => defaults.protocol_version,
            Some(v) => match ProtocolVersion::from_u8(v) {
                Some(pv) => pv,
                None => bail!("unsupported protocol version {v}"),
            },
        };
        let mtu = self.mtu.unwrap_or(DEFAULT_MTU).clamp(MIN_MTU, MAX_MTU);

        let fragment_size = self
            .transport
            .fragment_size
            .unwrap_or(DEFAULT_FRAGMENT_SIZE)
            .clamp(MIN_FRAGMENT_SIZE, max_fragment_size(mtu));
        let outbound = OutboundConfig {
            fragment_size,
            max_in_flight: self
                .transport
                .max_in_flight
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT)
                .max(1),
            max_sends: self.transport.max_sends.unwrap_or(MAX_SENDS).max(1),
            lifetime_ms: self
                .transport
                .message_lifetime_ms
                .unwrap_or(MESSAGE_LIFETIME_MS)
                .max(1_000),
        };

        let reassembly = ReassemblyConfig {
            expiry_ms: self
                .reassembly
                .expiry_ms
                .unwrap_or(MESSAGE_EXPIRY_MS)
                .max(1_000),
            max_messages: self
                .reassembly
                .max_messages
                .unwrap_or(MAX_INBOUND_MESSAGES)
                .max(1),
            recently_completed: self
                .reassembly
                .recently_completed
                .unwrap_or(RECENTLY_COMPLETED_CAPACITY)
                .max(16),
        };

        // A buffer must hold the largest fragment a peer with our MTU sends.
        let pool = PoolConfig {
            capacity: self.pool.capacity.unwrap_or(DEFAULT_POOL_CAPACITY).max(32),
            buffer_size: self
                .pool
                .buffer_size
                .unwrap_or(DEFAULT_BUFFER_SIZE)
                .max(max_fragment_size(mtu)),
        };

        Ok(NodeConfig {
            version,
            bind,
            protocol_version,
            mtu,
            outbound,
            reassembly,
            pool,
            max_concurrent_handshakes: self
                .handshake
                .max_concurrent
                .unwrap_or(MAX_CONCURRENT_ESTABLISHMENTS)
                .max(1),
            token_lifetime_ms: self.handshake.token_lifetime_ms.unwrap_or(TOKEN_LIFETIME_MS),
            ack_interval_ms: self.acks.min_interval_ms.unwrap_or(ACK_FREQUENCY_MS),
            delivery_capacity: self
                .delivery
                .queue_capacity
                .unwrap_or(DEFAULT_DELIVERY_CAPACITY)
                .max(1),
        })
    }
}

impl NodeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(NodeConfig::default());
        }
        let parsed: NodeConfigInput = toml::from_str(input).context("invalid config TOML")?;
        parsed.resolve()
    }

    /// Establishment settings for a socket bound to `local_port`.
    pub fn establish_config(&self, local_port: u16) -> EstablishConfig {
        EstablishConfig {
            version: self.protocol_version,
            local_port,
            max_concurrent: self.max_concurrent_handshakes,
            token_lifetime_ms: self.token_lifetime_ms,
            ..Default::default()
        }
    }

    pub fn max_packet_size(&self) -> usize {
        max_packet_size(self.mtu)
    }
}
