//! # skiff-transport
//!
//! Reliable, congestion-aware messaging over an unreliable datagram network.
//!
//! Messages are split into up to 32 fragments, acknowledged with compact
//! per-message bitfields, retransmitted until fully acknowledged, and paced
//! by a Westwood+ bandwidth estimate. Peers authenticate each other with a
//! multi-round handshake before any message flows.
//!
//! Everything here is pure logic driven by caller-supplied timestamps, except
//! the worker loops in [`runtime`]. Sockets live in `skiff-node`.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header and payload codecs
//! - [`pool`] — Bounded pool of fragment buffers
//! - [`reassembly`] — Per-message fragment reassembly and the per-peer table
//! - [`ack`] — ACK bitfields, per-peer ACK queues, cross-peer ACK scheduling
//! - [`outbound`] — Fragmentation, retransmission and ACK application
//! - [`handshake`] — Responder and initiator establishment state machines
//! - [`establish`] — Table of handshakes in progress, retry tokens
//! - [`bandwidth`] — Westwood+ bandwidth estimator
//! - [`rtt`] — RFC 6298 RTT / RTO tracking
//! - [`session`] — Per-peer state after establishment
//! - [`runtime`] — ACK sender and delivery worker threads
//! - [`crypto`] — Crypto service boundary
//! - [`clock`] — Millisecond clocks
//! - [`stats`] — Counters

pub mod ack;
pub mod bandwidth;
pub mod clock;
pub mod crypto;
pub mod establish;
pub mod handshake;
pub mod outbound;
pub mod pool;
pub mod reassembly;
pub mod rtt;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod wire;
