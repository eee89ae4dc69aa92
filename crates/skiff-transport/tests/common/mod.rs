//! Shared fixtures: a deterministic stand-in for the crypto service.
//!
//! Keys, signatures and "encryption" are derived from an FNV-style digest.
//! Nothing here is secure; it only has to be consistent between two peers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use skiff_transport::crypto::{CryptoFailure, CryptoService, KeyExchange, PeerId, SessionKeys};

pub fn digest(parts: &[&[u8]]) -> [u8; 32] {
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

struct XorExchange(Bytes);

impl KeyExchange for XorExchange {
    fn public_key(&self) -> Bytes {
        self.0.clone()
    }

    fn complete(self: Box<Self>, peer: &[u8]) -> Result<SessionKeys, CryptoFailure> {
        if peer.len() != self.0.len() {
            return Err(CryptoFailure::new("peer key length"));
        }
        let shared: Vec<u8> = self.0.iter().zip(peer).map(|(a, b)| a ^ b).collect();
        Ok(SessionKeys {
            cipher_key: Bytes::copy_from_slice(&digest(&[&shared[..], &b"cipher"[..]])),
            mac_key: Bytes::copy_from_slice(&digest(&[&shared[..], &b"mac"[..]])),
        })
    }
}

/// Identity-named test crypto. `seal` prefixes a one-byte tag so tests can
/// tell handshake-keyed and session-keyed packets apart.
pub struct TestCrypto {
    identity: Bytes,
    next_key: AtomicU8,
}

impl TestCrypto {
    pub fn new(name: &str) -> Self {
        TestCrypto {
            identity: Bytes::copy_from_slice(name.as_bytes()),
            next_key: AtomicU8::new(1),
        }
    }

    pub fn peer_id_of(name: &str) -> PeerId {
        PeerId(digest(&[name.as_bytes()]))
    }
}

impl CryptoService for TestCrypto {
    fn key_exchange(&self) -> Result<Box<dyn KeyExchange>, CryptoFailure> {
        let seed = self.next_key.fetch_add(1, Ordering::Relaxed);
        let public = digest(&[&self.identity[..], &[seed][..]]);
        Ok(Box::new(XorExchange(Bytes::copy_from_slice(&public))))
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
            Err(CryptoFailure::new("signature mismatch"))
        }
    }

    fn seal(&self, keys: Option<&SessionKeys>, plaintext: &[u8]) -> Result<Bytes, CryptoFailure> {
        let tag = keys.map_or(0u8, |k| k.cipher_key[0]);
        let mut out = Vec::with_capacity(plaintext.len() + 1);
        out.push(tag);
        out.extend_from_slice(plaintext);
        Ok(Bytes::from(out))
    }

    fn open(&self, keys: Option<&SessionKeys>, datagram: &[u8]) -> Result<Bytes, CryptoFailure> {
        let tag = keys.map_or(0u8, |k| k.cipher_key[0]);
        match datagram.split_first() {
            Some((t, rest)) if *t == tag => Ok(Bytes::copy_from_slice(rest)),
            _ => Err(CryptoFailure::new("mac mismatch")),
        }
    }
}
