//! Wall-clock and idle deadlines for one running worker.
//!
//! Pure bookkeeping over [`Instant`]s; the supervisor calls [`Watchdog::check`]
//! on every tick.

use std::time::Duration;

use atelier_core::failure::{FailureReason, TimeoutKind};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Watchdog {
    started_at: Instant,
    last_activity: Instant,
    wall_clock: Duration,
    idle: Duration,
}

impl Watchdog {
    pub fn new(now: Instant, wall_clock: Duration, idle: Duration) -> Self {
        Self {
            started_at: now,
            last_activity: now,
            wall_clock,
            idle,
        }
    }

    /// Record activity, pushing the idle deadline out.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// The timeout that has fired at `now`, if any. Wall-clock wins when both
    /// have.
    pub fn check(&self, now: Instant) -> Option<FailureReason> {
        if now.duration_since(self.started_at) >= self.wall_clock {
            return Some(FailureReason::TimeoutExceeded {
                kind: TimeoutKind::WallClock,
                limit: self.wall_clock,
            });
        }
        if now.duration_since(self.last_activity) >= self.idle {
            return Some(FailureReason::TimeoutExceeded {
                kind: TimeoutKind::Idle,
                limit: self.idle,
            });
        }
        None
    }
}
