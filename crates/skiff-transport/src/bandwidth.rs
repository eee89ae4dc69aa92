//! # Westwood+ Bandwidth Estimation
//!
//! Per-peer estimate of delivered throughput in bytes per millisecond, fed
//! with the number of bytes each incoming ACK newly covers.
//!
//! Samples accumulate and are folded in at most once per RTT (never more
//! often than every [`WESTWOOD_RTT_MIN_MS`]). Two cascaded low-pass filters
//! with gain `1/DECAY_FACTOR` smooth the raw `bytes / elapsed` samples:
//!
//! ```text
//!   sample ─► fast = (7·fast + sample) / 8 ─► smoothed = (7·smoothed + fast) / 8
//! ```
//!
//! When no ACK arrives for more than two RTTs, the gap is filled with
//! virtual zero samples (up to `2 · DECAY_FACTOR` of them) so an idle peer's
//! estimate decays instead of freezing.
//!
//! Writers serialize on a mutex and publish the whole filter state through
//! an `ArcSwap`; readers never block and always see a matched pair.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

pub const DECAY_FACTOR: u32 = 8;

/// Floor for the RTT gate and for the first sample's interval.
pub const WESTWOOD_RTT_MIN_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
struct WestwoodState {
    /// Time of the last filter update (or creation).
    t_ack_ms: u64,
    /// Bytes acked since `t_ack_ms`.
    acked_bytes: u64,
    sampled: bool,
    fast: f64,
    smoothed: f64,
}

fn filter(old: f64, sample: f64) -> f64 {
    let n = DECAY_FACTOR as f64;
    ((n - 1.0) * old + sample) / n
}

impl WestwoodState {
    fn decay(&mut self) {
        let n = DECAY_FACTOR as f64;
        self.fast *= (n - 1.0) / n;
        self.smoothed = filter(self.smoothed, self.fast);
    }

    fn update(&mut self, now_ms: u64, rtt_ms: u64) {
        let rtt = rtt_ms.max(WESTWOOD_RTT_MIN_MS);
        let mut elapsed = now_ms.saturating_sub(self.t_ack_ms);
        if elapsed > 2 * rtt {
            let steps = (elapsed / rtt - 1).min(2 * DECAY_FACTOR as u64);
            for _ in 0..steps {
                self.decay();
            }
            elapsed -= steps * rtt;
        }
        if self.acked_bytes > 0 {
            let sample = self.acked_bytes as f64 / elapsed.max(1) as f64;
            self.fast = filter(self.fast, sample);
            self.smoothed = filter(self.smoothed, self.fast);
        } else {
            self.decay();
        }
        self.acked_bytes = 0;
        self.t_ack_ms = now_ms;
    }

    fn due(&self, now_ms: u64, rtt_ms: u64) -> bool {
        now_ms.saturating_sub(self.t_ack_ms) >= rtt_ms.max(WESTWOOD_RTT_MIN_MS)
    }
}

/// Filtered throughput estimate for one peer.
pub struct BandwidthEstimator {
    writer: Mutex<()>,
    state: ArcSwap<WestwoodState>,
}

impl BandwidthEstimator {
    pub fn new(now_ms: u64) -> Self {
        BandwidthEstimator {
            writer: Mutex::new(()),
            state: ArcSwap::from_pointee(WestwoodState {
                t_ack_ms: now_ms,
                acked_bytes: 0,
                sampled: false,
                fast: 0.0,
                smoothed: 0.0,
            }),
        }
    }

    /// Record `acked_bytes` newly acknowledged at `now_ms`.
    pub fn add_sample(&self, acked_bytes: u64, now_ms: u64, rtt_ms: u64) {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut st = **self.state.load();
        if !st.sampled {
            let elapsed = now_ms
                .saturating_sub(st.t_ack_ms)
                .max(WESTWOOD_RTT_MIN_MS);
            let rate = acked_bytes as f64 / elapsed as f64;
            st.fast = rate;
            st.smoothed = rate;
            st.sampled = true;
            st.acked_bytes = 0;
            st.t_ack_ms = now_ms;
        } else {
            st.acked_bytes += acked_bytes;
            if st.due(now_ms, rtt_ms) {
                st.update(now_ms, rtt_ms);
            }
        }
        self.state.store(Arc::new(st));
    }

    /// Estimated bytes per millisecond as of `now_ms`.
    ///
    /// If an RTT has passed since the last update, the pending bytes (or the
    /// idle decay) are applied to a copy of the state; the stored estimate
    /// is left as it was.
    pub fn bandwidth_estimate(&self, now_ms: u64, rtt_ms: u64) -> f64 {
        let mut st = **self.state.load();
        if !st.sampled {
            return 0.0;
        }
        if st.due(now_ms, rtt_ms) {
            st.update(now_ms, rtt_ms);
        }
        st.smoothed
    }

    /// Smoothed estimate as of the last update, without projection.
    pub fn smoothed(&self) -> f64 {
        self.state.load().smoothed
    }

    /// First-stage (fast) filter value as of the last update.
    pub fn fast(&self) -> f64 {
        self.state.load().fast
    }

    pub fn last_update_ms(&self) -> u64 {
        self.state.load().t_ack_ms
    }
}

impl std::fmt::Debug for BandwidthEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.load();
        f.debug_struct("BandwidthEstimator")
            .field("fast", &st.fast)
            .field("smoothed", &st.smoothed)
            .field("t_ack_ms", &st.t_ack_ms)
            .field("acked_bytes", &st.acked_bytes)
            .finish()
    }
}
