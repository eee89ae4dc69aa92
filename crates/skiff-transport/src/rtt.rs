//! # RTT Tracking
//!
//! RFC 6298 SRTT/RTTVAR smoothing over round-trip samples taken from
//! acknowledged messages, and the retransmission timeout derived from them.

/// RTO floor and ceiling.
pub const MIN_RTO_MS: u64 = 1_000;
pub const MAX_RTO_MS: u64 = 60_000;

/// RTO before the first sample arrives.
pub const INITIAL_RTO_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct RttTracker {
    /// Smoothed RTT (SRTT) in ms.
    srtt_ms: f64,
    /// RTT variation (RTTVAR) in ms.
    rttvar_ms: f64,
    min_rtt_ms: u64,
    max_rtt_ms: u64,
    sample_count: u64,
    rto_ms: u64,
}

impl RttTracker {
    pub fn new() -> Self {
        RttTracker {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            min_rtt_ms: u64::MAX,
            max_rtt_ms: 0,
            sample_count: 0,
            rto_ms: INITIAL_RTO_MS,
        }
    }

    /// Fold in one measured round trip.
    pub fn on_sample(&mut self, rtt_ms: u64) {
        self.sample_count += 1;
        self.min_rtt_ms = self.min_rtt_ms.min(rtt_ms);
        self.max_rtt_ms = self.max_rtt_ms.max(rtt_ms);

        let rtt = rtt_ms as f64;
        if self.sample_count == 1 {
            self.srtt_ms = rtt;
            self.rttvar_ms = rtt / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_ms = 0.75 * self.rttvar_ms + 0.25 * (self.srtt_ms - rtt).abs();
            self.srtt_ms = 0.875 * self.srtt_ms + 0.125 * rtt;
        }
        let rto = (self.srtt_ms + 4.0 * self.rttvar_ms).round() as u64;
        self.rto_ms = rto.clamp(MIN_RTO_MS, MAX_RTO_MS);
    }

    /// Smoothed RTT rounded to ms, 0 before any sample.
    pub fn rtt_ms(&self) -> u64 {
        self.srtt_ms.round() as u64
    }

    pub fn srtt_ms(&self) -> f64 {
        self.srtt_ms
    }

    pub fn rttvar_ms(&self) -> f64 {
        self.rttvar_ms
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn min_rtt_ms(&self) -> Option<u64> {
        (self.sample_count > 0).then_some(self.min_rtt_ms)
    }

    pub fn max_rtt_ms(&self) -> u64 {
        self.max_rtt_ms
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_srtt() {
        let mut rtt = RttTracker::new();
        assert_eq!(rtt.rto_ms(), INITIAL_RTO_MS);
        rtt.on_sample(400);
        assert_eq!(rtt.rtt_ms(), 400);
        assert_eq!(rtt.rttvar_ms(), 200.0);
        // 400 + 4·200
        assert_eq!(rtt.rto_ms(), 1_200);
        assert_eq!(rtt.min_rtt_ms(), Some(400));
    }

    #[test]
    fn smoothing_follows_rfc6298() {
        let mut rtt = RttTracker::new();
        rtt.on_sample(100);
        rtt.on_sample(200);
        // rttvar = 0.75·50 + 0.25·100, srtt = 0.875·100 + 0.125·200
        assert!((rtt.rttvar_ms() - 62.5).abs() < 1e-9);
        assert!((rtt.srtt_ms() - 112.5).abs() < 1e-9);
        assert_eq!(rtt.rto_ms(), MIN_RTO_MS, "clamped to floor");
        assert_eq!(rtt.max_rtt_ms(), 200);
    }

    #[test]
    fn rto_is_clamped_to_ceiling() {
        let mut rtt = RttTracker::new();
        rtt.on_sample(50_000);
        assert_eq!(rtt.rto_ms(), MAX_RTO_MS);
        assert_eq!(rtt.min_rtt_ms(), Some(50_000));
    }
}
