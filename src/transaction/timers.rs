//! RFC 3261 §17 timer values. T1/T2 are configurable; the rest are derived
//! from them exactly as the RFC defines.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub t1: Duration,
    pub t2: Duration,
}

impl TimerConfig {
    pub fn new(t1_millis: u64, t2_millis: u64) -> Self {
        Self {
            t1: Duration::from_millis(t1_millis),
            t2: Duration::from_millis(t2_millis),
        }
    }

    /// Timer D: wait time for response retransmits, client INVITE.
    pub fn timer_d(&self) -> Duration {
        Duration::from_secs(32)
    }

    /// Timer H: wait time for ACK receipt, server INVITE.
    pub fn timer_h(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer I: wait time in Confirmed state, server INVITE (UDP).
    pub fn timer_i(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Timer J: wait time in Completed state, server non-INVITE (UDP).
    pub fn timer_j(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer K: wait time in Completed state, client non-INVITE (UDP).
    pub fn timer_k(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Next retransmit interval for request/response retransmission,
    /// doubling up to T2 (RFC 3261 §17.1.1.2 / §17.2.1).
    pub fn next_retransmit(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.t2)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self::new(500, 4000)
    }
}
