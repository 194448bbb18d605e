use crate::events::Timestamp;
use std::time::Duration;

/// Ceiling of every debounce window
///
/// An active fault is never silenced for longer than a day.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Escalating debounce window for one alerting entity
///
/// The first alert opens a window of `initial` length; every further alert
/// that gets through doubles it, up to [`MAX_BACKOFF`]. Alerts arriving
/// while the window is open are suppressed. A zero window means no backoff
/// is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backoff {
    /// When the last alert for this entity went out
    last_notified_at: Option<Timestamp>,
    /// Length of the current window, zero when inactive
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the current window
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn last_notified_at(&self) -> Option<Timestamp> {
        self.last_notified_at
    }

    pub fn is_active(&self) -> bool {
        !self.current.is_zero()
    }

    /// Whether more time than the current window has passed since the last alert
    ///
    /// An entity that never alerted counts as infinitely long ago. A clock
    /// that went backwards counts as zero elapsed time.
    pub fn window_elapsed(&self, now: Timestamp) -> bool {
        match self.last_notified_at {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed > self.current
            }
        }
    }

    /// Admit an alert if the window has elapsed, escalating the window
    ///
    /// # Returns
    ///
    /// `true` if the alert may be sent, `false` if it is suppressed. A
    /// suppressed alert leaves the state untouched.
    pub fn try_fire(&mut self, now: Timestamp, initial: Duration) -> bool {
        if !self.window_elapsed(now) {
            return false;
        }
        self.record_fire(now, initial);
        true
    }

    /// Record an alert at `now` and escalate the window
    pub fn record_fire(&mut self, now: Timestamp, initial: Duration) {
        self.last_notified_at = Some(now);
        self.current = if self.current.is_zero() {
            initial.min(MAX_BACKOFF)
        } else {
            self.current
                .checked_mul(2)
                .unwrap_or(MAX_BACKOFF)
                .min(MAX_BACKOFF)
        };
    }

    /// Drop back to the inactive state
    pub fn reset(&mut self) {
        self.last_notified_at = None;
        self.current = Duration::ZERO;
    }
}
