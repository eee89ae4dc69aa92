//! # Crypto Service Boundary
//!
//! The engine never touches key material or cipher primitives directly. The
//! embedder supplies a [`CryptoService`]; every failure it reports collapses
//! into a single [`CryptoFailure`].

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("crypto failure: {0}")]
pub struct CryptoFailure(pub String);

impl CryptoFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        CryptoFailure(reason.into())
    }
}

/// Stable identifier of a verified peer identity (e.g. its hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Symmetric keys for an established session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub cipher_key: Bytes,
    pub mac_key: Bytes,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("cipher_key", &format_args!("<{} bytes>", self.cipher_key.len()))
            .field("mac_key", &format_args!("<{} bytes>", self.mac_key.len()))
            .finish()
    }
}

/// One side of an ephemeral key agreement.
pub trait KeyExchange: Send {
    fn public_key(&self) -> Bytes;

    /// Combine with the peer's public key into session keys.
    fn complete(self: Box<Self>, peer_public: &[u8]) -> Result<SessionKeys, CryptoFailure>;
}

pub trait CryptoService: Send + Sync {
    /// Start a fresh ephemeral key agreement.
    fn key_exchange(&self) -> Result<Box<dyn KeyExchange>, CryptoFailure>;

    /// Our long-term identity, sent to the responder during confirmation.
    fn local_identity(&self) -> Bytes;

    /// Sign with our long-term identity key.
    fn sign(&self, data: &[u8]) -> Result<Bytes, CryptoFailure>;

    /// Check `signature` over `data` against `identity` and return its id.
    fn verify_identity(
        &self,
        identity: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<PeerId, CryptoFailure>;

    /// Encrypt and authenticate a plaintext packet. `None` means the
    /// handshake (intro) key.
    fn seal(&self, keys: Option<&SessionKeys>, plaintext: &[u8]) -> Result<Bytes, CryptoFailure>;

    /// Inverse of [`seal`](CryptoService::seal).
    fn open(&self, keys: Option<&SessionKeys>, datagram: &[u8]) -> Result<Bytes, CryptoFailure>;
}
