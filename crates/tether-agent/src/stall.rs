//! Per-session stall state machine.
//!
//! Four states: `Idle` (never seen output), `Active`, `Stale` (idle
//! past the threshold once), `Notified` (stall notification sent).
//! Transitions:
//!
//! ```text
//! Idle            --(buffer change)-->      Active
//! Active          --(idle >= threshold)-->  Stale
//! Stale           --(idle >= threshold)-->  Notified   [notify side effect]
//! Stale, Notified --(buffer change)-->      Active
//! ```
//!
//! Single-writer: only the monitor loop mutates a tracker. The clock is
//! injected so the machine can be unit-tested without sleeping.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallState {
    Idle,
    Active,
    Stale,
    Notified,
}

#[derive(Debug)]
pub struct StallTracker {
    state: StallState,
    last_activity: Instant,
    notified_at: Option<Instant>,
}

impl StallTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            state: StallState::Idle,
            last_activity: now,
            notified_at: None,
        }
    }

    pub fn state(&self) -> StallState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record a buffer change. Every state moves to `Active`.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.state = StallState::Active;
    }

    /// Periodic stall check. Returns `true` exactly when a stall
    /// notification must be sent (the `Stale -> Notified` edge).
    ///
    /// `Idle` and `Notified` sessions are skipped; only new activity
    /// re-arms the machine.
    pub fn check(&mut self, now: Instant, threshold: Duration) -> bool {
        match self.state {
            StallState::Idle | StallState::Notified => false,
            StallState::Active => {
                if now.duration_since(self.last_activity) >= threshold {
                    self.state = StallState::Stale;
                }
                false
            }
            StallState::Stale => {
                if now.duration_since(self.last_activity) >= threshold {
                    self.state = StallState::Notified;
                    self.notified_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(30);

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn idle_sessions_never_notify() {
        let base = Instant::now();
        let mut tracker = StallTracker::new(base);
        assert_eq!(tracker.state(), StallState::Idle);
        for tick in (0..300).step_by(5) {
            assert!(!tracker.check(at(base, tick), THRESHOLD));
        }
        assert_eq!(tracker.state(), StallState::Idle);
    }

    #[test]
    fn exactly_one_notification_per_idle_period() {
        let base = Instant::now();
        let mut tracker = StallTracker::new(base);
        tracker.record_activity(base);

        let mut notifications = 0;
        for tick in (5..=120).step_by(5) {
            if tracker.check(at(base, tick), THRESHOLD) {
                notifications += 1;
            }
        }
        assert_eq!(notifications, 1);
        assert_eq!(tracker.state(), StallState::Notified);
    }

    #[test]
    fn activity_after_notification_rearms_the_machine() {
        let base = Instant::now();
        let mut tracker = StallTracker::new(base);
        tracker.record_activity(base);

        // First idle period: Active -> Stale -> Notified.
        assert!(!tracker.check(at(base, 30), THRESHOLD));
        assert!(tracker.check(at(base, 35), THRESHOLD));

        // Buffer change at second 40 re-arms.
        tracker.record_activity(at(base, 40));
        assert_eq!(tracker.state(), StallState::Active);

        // Second independent idle period produces a second notification.
        assert!(!tracker.check(at(base, 70), THRESHOLD));
        assert!(tracker.check(at(base, 75), THRESHOLD));
        assert_eq!(tracker.state(), StallState::Notified);

        // And nothing further without new activity.
        assert!(!tracker.check(at(base, 300), THRESHOLD));
    }

    #[test]
    fn activity_within_threshold_stays_active() {
        let base = Instant::now();
        let mut tracker = StallTracker::new(base);
        tracker.record_activity(base);

        assert!(!tracker.check(at(base, 10), THRESHOLD));
        assert_eq!(tracker.state(), StallState::Active);
        tracker.record_activity(at(base, 20));
        assert!(!tracker.check(at(base, 45), THRESHOLD));
        assert_eq!(tracker.state(), StallState::Active);
    }
}
