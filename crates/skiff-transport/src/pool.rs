//! # Fragment Buffer Pool
//!
//! Bounded pool of fixed-size buffers for inbound fragments. A buffer is
//! moved out on [`FragmentPool::acquire`] and owned by exactly one
//! reassembler until it is handed back with [`FragmentPool::release`].
//! Buffers are allocated lazily up to `capacity`; once that many are out the
//! pool refuses further requests instead of growing.
//!
//! At the default 4096 × 1536 bytes the pool tops out around 6 MB.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Default bytes per buffer, enough for one fragment of a typical MTU.
pub const DEFAULT_BUFFER_SIZE: usize = 1536;

/// Default number of buffers shared by all in-flight inbound messages.
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("fragment pool exhausted ({capacity} buffers in use)")]
    Exhausted { capacity: usize },
    #[error("fragment of {len} bytes exceeds buffer size {buffer_size}")]
    TooLarge { len: usize, buffer_size: usize },
}

// ─── FragmentBuffer ─────────────────────────────────────────────────────────

/// One pooled buffer holding a fragment payload.
#[derive(Debug)]
pub struct FragmentBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl FragmentBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ─── FragmentPool ───────────────────────────────────────────────────────────

struct PoolInner {
    free: Vec<Box<[u8]>>,
    outstanding: usize,
}

pub struct FragmentPool {
    inner: Mutex<PoolInner>,
    buffer_size: usize,
    capacity: usize,
    exhausted: AtomicU64,
}

impl FragmentPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        FragmentPool {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                outstanding: 0,
            }),
            buffer_size,
            capacity,
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers that can still be acquired.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.capacity - inner.outstanding
    }

    /// Buffers currently held by reassemblers.
    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outstanding
    }

    /// Times `acquire` was refused because every buffer was out.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Take a buffer and copy `payload` into it.
    pub fn acquire(&self, payload: &[u8]) -> Result<FragmentBuffer, PoolError> {
        if payload.len() > self.buffer_size {
            return Err(PoolError::TooLarge {
                len: payload.len(),
                buffer_size: self.buffer_size,
            });
        }
        let mut data = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.outstanding >= self.capacity {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted {
                    capacity: self.capacity,
                });
            }
            inner.outstanding += 1;
            inner.free.pop()
        }
        .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        data[..payload.len()].copy_from_slice(payload);
        Ok(FragmentBuffer {
            data,
            len: payload.len(),
        })
    }

    /// Return a buffer. Buffers of a foreign size are dropped but still
    /// counted back.
    pub fn release(&self, buffer: FragmentBuffer) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if buffer.data.len() == self.buffer_size {
            inner.free.push(buffer.data);
        }
    }
}

impl Default for FragmentPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }
}

impl std::fmt::Debug for FragmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentPool")
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
