//! Retransmit interval estimation and bitrate pacing for the sender.
//!
//! - [`RetransmitTimer`] turns ack round-trip samples into the delay between
//!   two transmission rounds of the current frame.  The smoothed estimate is
//!   Jacobson's algorithm (RFC 6298 §2); the resulting interval is
//!   `SRTT + 4·RTTVAR + 5 ms`, clamped to `[15 ms, max_network_latency]`.
//!   Before the first sample the estimate is 100 ms.
//! - [`RatePacer`] spaces out data packets so the emission rate stays under
//!   `max_bitrate`.

use std::time::Duration;

use tokio::time::Instant;

/// Estimate used before any round trip was measured.
pub const DEFAULT_ESTIMATED_LATENCY: Duration = Duration::from_millis(100);
/// Added to the estimate so a retransmit does not race the in-flight ack.
pub const RETRANSMIT_MARGIN: Duration = Duration::from_millis(5);
/// Floor of the retransmit interval.
pub const MIN_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(15);

/// Smoothed round-trip estimator bounded by `max_network_latency`.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    max_interval: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
    current: Duration,
}

impl RetransmitTimer {
    pub fn new(max_network_latency: Duration) -> Self {
        let mut timer = Self {
            max_interval: max_network_latency,
            srtt: None,
            rttvar: None,
            current: DEFAULT_ESTIMATED_LATENCY,
        };
        timer.reset();
        timer
    }

    /// Record a new RTT sample and update SRTT / RTTVAR.
    ///
    /// First sample:  SRTT = R,  RTTVAR = R/2.
    /// Later samples: RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|,
    ///                SRTT   = 7/8·SRTT   + 1/8·R.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Current delay between two transmission rounds.
    pub fn interval(&self) -> Duration {
        self.current
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    fn reset(&mut self) {
        let estimate = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => srtt + rttvar * 4,
            _ => DEFAULT_ESTIMATED_LATENCY,
        };
        // max_network_latency wins over the floor when it is smaller.
        self.current = (estimate + RETRANSMIT_MARGIN)
            .max(MIN_RETRANSMIT_INTERVAL)
            .min(self.max_interval);
    }
}

/// Spaces packets so that at most `bits_per_second` leave the sender.
#[derive(Debug, Clone)]
pub struct RatePacer {
    bits_per_second: u64,
    next_free: Option<Instant>,
}

impl RatePacer {
    /// `0` disables pacing.
    pub fn new(bits_per_second: u64) -> Self {
        Self {
            bits_per_second,
            next_free: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bits_per_second == 0
    }

    /// Reserve airtime for a packet of `bytes` and return how long to wait
    /// before sending it.
    pub fn reserve(&mut self, bytes: usize, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let start = match self.next_free {
            Some(t) if t > now => t,
            _ => now,
        };
        let nanos = (bytes as u128 * 8 * 1_000_000_000) / u128::from(self.bits_per_second);
        let cost = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        self.next_free = Some(start + cost);
        start - now
    }
}
