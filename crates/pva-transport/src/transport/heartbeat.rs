//! Liveness tracking for one transport.
//!
//! Pure bookkeeping: the caller feeds in traffic timestamps and asks what to
//! do at a given instant, so the thresholds can be tested without sleeping.

use std::time::{Duration, Instant};

/// What the heartbeat timer should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatCheck {
    /// Send an echo to provoke traffic from the peer.
    pub probe: bool,
    /// The peer went quiet for longer than twice the interval just now.
    pub became_unresponsive: bool,
}

#[derive(Debug)]
pub struct Liveness {
    interval: Duration,
    last_inbound: Instant,
    /// Last traffic in either direction.
    last_activity: Instant,
    unresponsive: bool,
}

impl Liveness {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last_inbound: now, last_activity: now, unresponsive: false }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_unresponsive(&self) -> bool {
        self.unresponsive
    }

    /// Record received bytes. Returns true if this ended an unresponsive
    /// period.
    pub fn on_inbound(&mut self, now: Instant) -> bool {
        self.last_inbound = now;
        self.last_activity = now;
        std::mem::replace(&mut self.unresponsive, false)
    }

    pub fn on_outbound(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn check_at(&mut self, now: Instant) -> HeartbeatCheck {
        let silent = now.saturating_duration_since(self.last_inbound);
        let idle = now.saturating_duration_since(self.last_activity);

        let became_unresponsive = !self.unresponsive && silent > self.interval * 2;
        if became_unresponsive {
            self.unresponsive = true;
        }

        HeartbeatCheck { probe: idle > self.interval.mul_f64(0.75), became_unresponsive }
    }
}
