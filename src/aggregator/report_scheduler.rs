use super::JournalBuffer;
use crate::alerts::AlertStateMachine;
use crate::collectors::sleep_while_running;
use crate::error::CollectorError;
use crate::events::{Alert, Priority, Timestamp};
use chrono::Utc;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Subject of the coalesced journal report
pub const JOURNAL_REPORT_SUBJECT: &str = "BTRFS kernel errors detected";

/// Operator guidance appended after the reported lines
pub const JOURNAL_GUIDANCE: &str = "Check with sudo journalctl -t kernel | grep -i btrfs";

/// Periodically flushes the journal buffer into one coalesced report
///
/// Each cycle consults the state machine's journal debounce. When a report is
/// admitted the scheduler waits a grace window so that near-simultaneous
/// kernel lines end up in the same notification, then drains the buffer.
pub struct ReportScheduler {
    machine: Arc<AlertStateMachine>,
    buffer: Arc<JournalBuffer>,
    interval: Duration,
    grace: Duration,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReportScheduler {
    /// Create a scheduler
    ///
    /// # Arguments
    ///
    /// * `machine` - Owner of the journal debounce state and the notifier
    /// * `buffer` - Buffer filled by the journal collector
    /// * `interval` - Time between report cycles
    /// * `grace` - Extra collection time once a report is admitted
    pub fn new(
        machine: Arc<AlertStateMachine>,
        buffer: Arc<JournalBuffer>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            machine,
            buffer,
            interval,
            grace,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Start the background report thread
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let machine = Arc::clone(&self.machine);
        let buffer = Arc::clone(&self.buffer);
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let grace = self.grace;

        let handle = thread::Builder::new()
            .name("report-scheduler".to_string())
            .spawn(move || {
                while sleep_while_running(interval, &running) {
                    Self::cycle(&machine, &buffer, grace, &running, Utc::now());
                }
                debug!("Report scheduler thread finished");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                CollectorError::SubprocessSpawn(format!("report thread: {}", e))
            })?;

        self.thread_handle = Some(handle);
        info!(
            "ReportScheduler started (interval {}s, grace {}s)",
            self.interval.as_secs(),
            self.grace.as_secs()
        );
        Ok(())
    }

    /// Stop the report thread and wait for it
    ///
    /// A cycle sitting in its grace window is abandoned; buffered lines are
    /// not flushed.
    pub fn stop(&mut self) -> Result<(), CollectorError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| {
                CollectorError::SubprocessTerminated("Failed to join report thread".to_string())
            })?;
        }

        info!("ReportScheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one report cycle as of `now`
    ///
    /// # Returns
    ///
    /// `true` if a report was sent
    pub fn run_cycle(&self, now: Timestamp) -> bool {
        Self::cycle(&self.machine, &self.buffer, self.grace, &self.running, now)
    }

    fn cycle(
        machine: &AlertStateMachine,
        buffer: &JournalBuffer,
        grace: Duration,
        running: &AtomicBool,
        now: Timestamp,
    ) -> bool {
        if buffer.is_empty() {
            machine.note_journal_quiet(now);
            return false;
        }

        if !machine.admit_journal_report(now) {
            // Lines stay buffered for a later cycle
            return false;
        }

        debug!(
            "Journal errors detected, collecting for another {}s",
            grace.as_secs()
        );
        if !sleep_while_running(grace, running) {
            debug!("Shutdown during grace window, report abandoned");
            return false;
        }

        let mut lines = buffer.take_all();
        if lines.is_empty() {
            return false;
        }
        lines.push(String::new());
        lines.push(JOURNAL_GUIDANCE.to_string());

        machine
            .notifier()
            .send_alert(&Alert::new(JOURNAL_REPORT_SUBJECT, lines, Priority::High));
        true
    }
}

impl Drop for ReportScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
