use crate::alerts::Backoff;
use crate::events::{Alert, Priority, Timestamp};
use crate::notifications::Notifier;
use chrono::Utc;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Alert state of one mount point
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountErrorState {
    /// Aggregate device error count seen on the last poll
    pub last_count: u64,
    /// Debounce window of the error alerts
    pub backoff: Backoff,
}

/// Every piece of per-entity state, guarded by one lock
#[derive(Debug, Default)]
struct AlertState {
    mounts: HashMap<String, MountErrorState>,
    missing: HashMap<String, bool>,
    journal: Backoff,
    /// Ticket handed to the next alert, in decision order
    next_ticket: u64,
}

impl AlertState {
    fn missing_transition(&mut self, group: &str, is_missing: bool) -> Option<Alert> {
        let was_missing = self.missing.get(group).copied().unwrap_or(false);

        let alert = match (was_missing, is_missing) {
            (false, true) => {
                let message = format!("Missing device detected for {}", group);
                error!("{}", message);
                Some(Alert::new("Missing device", vec![message], Priority::High))
            }
            (true, false) => {
                let message = format!("Missing device back to normal on {}", group);
                info!("{}", message);
                Some(Alert::new("Missing device OK", vec![message], Priority::Normal))
            }
            _ => None,
        };

        self.missing.insert(group.to_string(), is_missing);
        alert
    }

    fn error_transition(
        &mut self,
        mount: &str,
        count: u64,
        now: Timestamp,
        initial_backoff: Duration,
    ) -> Option<Alert> {
        let state = self.mounts.entry(mount.to_string()).or_default();
        let previous = state.last_count;

        let alert = if count > previous {
            if state.backoff.try_fire(now, initial_backoff) {
                error!("BTRFS error count increased on {} to {}", mount, count);
                Some(Alert::new(
                    "BTRFS errors",
                    vec![
                        format!("BTRFS error count increased on {} to {}", mount, count),
                        format!("Run sudo btrfs device stats {} to check.", mount),
                    ],
                    Priority::High,
                ))
            } else {
                debug!(
                    "Error count increased on {} to {}, notification suppressed (debounce active, wait {}s)",
                    mount,
                    count,
                    state.backoff.current().as_secs()
                );
                None
            }
        } else if previous > 0 && count == 0 {
            info!("Error count back to normal on {}", mount);
            state.backoff.reset();
            Some(Alert::new(
                "BTRFS errors back to normal",
                vec![
                    format!("Error count back to normal on {}", mount),
                    format!("Run sudo btrfs device stats {} to check.", mount),
                ],
                Priority::Normal,
            ))
        } else {
            if count < previous {
                debug!(
                    "Error count on {} dropped from {} to {} without reaching zero",
                    mount, previous, count
                );
            }
            None
        };

        state.last_count = count;
        alert
    }
}

/// Single owner of all alerting state
///
/// Turns raw observations into edge-triggered, debounced alerts. Decisions
/// are made under one internal lock; the resulting notification is sent after
/// the lock is released, so a slow channel never blocks other observers.
/// Each alert takes a ticket while the decision is made and sends wait for
/// their turn, so concurrent callers deliver in decision order. A failed send
/// does not roll back the transition that caused it.
pub struct AlertStateMachine {
    state: Mutex<AlertState>,
    notifier: Arc<Notifier>,
    initial_backoff: Duration,
    /// Ticket whose alert may be sent now
    serving: Mutex<u64>,
    turn: Condvar,
}

/// Hands the turn to the next ticket when dropped, even if a send panics
struct SendTurn<'a> {
    machine: &'a AlertStateMachine,
}

impl Drop for SendTurn<'_> {
    fn drop(&mut self) {
        let mut serving = self
            .machine
            .serving
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *serving += 1;
        self.machine.turn.notify_all();
    }
}

impl AlertStateMachine {
    /// Create an empty state machine
    ///
    /// # Arguments
    ///
    /// * `notifier` - Where alerts are sent
    /// * `initial_backoff` - First debounce window after an alert
    pub fn new(notifier: Arc<Notifier>, initial_backoff: Duration) -> Self {
        Self {
            state: Mutex::new(AlertState::default()),
            notifier,
            initial_backoff,
            serving: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a transition under the state lock and ticket its alert
    fn decide<F>(&self, transition: F) -> Option<(u64, Alert)>
    where
        F: FnOnce(&mut AlertState) -> Option<Alert>,
    {
        let mut state = self.lock();
        let alert = transition(&mut state)?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        Some((ticket, alert))
    }

    fn dispatch(&self, decided: Option<(u64, Alert)>) -> bool {
        let Some((ticket, alert)) = decided else {
            return false;
        };

        let mut serving = self.serving.lock().unwrap_or_else(PoisonError::into_inner);
        while *serving != ticket {
            serving = self
                .turn
                .wait(serving)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(serving);

        let _turn = SendTurn { machine: self };
        self.notifier.send_alert(&alert);
        true
    }

    /// Record whether a redundancy group has a missing member
    ///
    /// Notifies only when the flag changes. Unseen groups start as not missing.
    ///
    /// # Returns
    ///
    /// `true` if a notification was sent
    pub fn observe_missing(&self, group: &str, is_missing: bool) -> bool {
        let decided = self.decide(|state| state.missing_transition(group, is_missing));
        self.dispatch(decided)
    }

    /// Record the aggregate device error count of a mount point
    ///
    /// # Returns
    ///
    /// `true` if a notification was sent
    pub fn observe_error_count(&self, mount: &str, count: u64) -> bool {
        self.observe_error_count_at(mount, count, Utc::now())
    }

    /// Record an error count observed at a specific time
    ///
    /// An increase alerts unless the mount's debounce window is still open;
    /// a drop to zero from a nonzero count alerts and clears the window; any
    /// other change is adopted silently.
    pub fn observe_error_count_at(&self, mount: &str, count: u64, now: Timestamp) -> bool {
        let decided =
            self.decide(|state| state.error_transition(mount, count, now, self.initial_backoff));
        self.dispatch(decided)
    }

    /// Ask whether a journal report may go out at `now`
    ///
    /// Applies the same escalating debounce as the error counters, keyed on
    /// the single journal entity. An admitted report escalates the window.
    pub fn admit_journal_report(&self, now: Timestamp) -> bool {
        let mut state = self.lock();
        let admitted = state.journal.try_fire(now, self.initial_backoff);
        if !admitted {
            debug!(
                "Journal errors detected, notification suppressed (debounce active, wait {}s)",
                state.journal.current().as_secs()
            );
        }
        admitted
    }

    /// Note a report cycle with nothing buffered
    ///
    /// Once the journal has been quiet for a whole debounce window its
    /// backoff drops back to zero.
    pub fn note_journal_quiet(&self, now: Timestamp) {
        let mut state = self.lock();
        if state.journal.is_active() && state.journal.window_elapsed(now) {
            debug!("Journal quiet for a full debounce window, resetting backoff");
            state.journal.reset();
        }
    }

    /// Snapshot of a mount's alert state
    pub fn mount_state(&self, mount: &str) -> Option<MountErrorState> {
        self.lock().mounts.get(mount).cloned()
    }

    /// Last recorded missing flag of a group, false if unseen
    pub fn is_missing(&self, group: &str) -> bool {
        self.lock().missing.get(group).copied().unwrap_or(false)
    }

    /// Snapshot of the journal report backoff
    pub fn journal_backoff(&self) -> Backoff {
        self.lock().journal.clone()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::notifications::channels::RecordingChannel;
    use chrono::Duration as ChronoDuration;
    use quickcheck_macros::quickcheck;

    fn machine() -> (AlertStateMachine, RecordingChannel) {
        let channel = RecordingChannel::new(1000);
        let notifier = Arc::new(Notifier::new("host", vec![Box::new(channel.clone())]));
        (
            AlertStateMachine::new(notifier, Duration::from_secs(3600)),
            channel,
        )
    }

    // With observations a day apart every window has expired, so exactly the
    // increases and the drops to zero notify.
    #[quickcheck]
    fn prop_spaced_counts_alert_on_increase_and_recovery(counts: Vec<u8>) -> bool {
        let (machine, channel) = machine();
        let mut now = Utc::now();
        let mut previous = 0u64;
        let mut expected = 0usize;

        for count in counts {
            let count = u64::from(count % 4);
            if count > previous || (previous > 0 && count == 0) {
                expected += 1;
            }
            previous = count;
            machine.observe_error_count_at("/", count, now);
            now += ChronoDuration::hours(25);
        }

        channel.count() == expected
    }

    #[quickcheck]
    fn prop_missing_alerts_only_on_change(flags: Vec<bool>) -> bool {
        let (machine, channel) = machine();
        let mut previous = false;
        let mut expected = 0usize;

        for flag in flags {
            if flag != previous {
                expected += 1;
            }
            previous = flag;
            machine.observe_missing("g", flag);
        }

        channel.count() == expected
    }

    #[quickcheck]
    fn prop_repeated_count_never_alerts_twice(count: u64, repeats: u8) -> bool {
        let (machine, channel) = machine();
        let mut now = Utc::now();
        machine.observe_error_count_at("/", count, now);
        let after_first = channel.count();

        for _ in 0..(repeats % 10) {
            now += ChronoDuration::hours(30);
            machine.observe_error_count_at("/", count, now);
        }

        channel.count() == after_first
    }
}
