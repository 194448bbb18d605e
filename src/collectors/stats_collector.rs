use super::{sleep_while_running, BtrfsSource};
use crate::alerts::AlertStateMachine;
use crate::error::CollectorError;
use crate::events::aggregate_errors;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outcome counts of one polling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub mounts_checked: usize,
    pub mounts_failed: usize,
    pub groups_checked: usize,
    pub groups_failed: usize,
}

/// Periodically feeds device error counts and missing flags to the state machine
///
/// A failed query only skips the affected mount or group for this cycle. Its
/// last known state stays in place until a later cycle succeeds.
pub struct StatsCollector {
    source: Arc<dyn BtrfsSource>,
    machine: Arc<AlertStateMachine>,
    /// Configured mount points; empty means read the mount table every cycle
    mountpoints: Vec<PathBuf>,
    interval: Duration,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl StatsCollector {
    pub fn new(
        source: Arc<dyn BtrfsSource>,
        machine: Arc<AlertStateMachine>,
        mountpoints: Vec<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            machine,
            mountpoints,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Start polling in the background, beginning with an immediate cycle
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let source = Arc::clone(&self.source);
        let machine = Arc::clone(&self.machine);
        let mountpoints = self.mountpoints.clone();
        let running = Arc::clone(&self.running);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("stats-collector".to_string())
            .spawn(move || {
                loop {
                    Self::poll(source.as_ref(), &machine, &mountpoints);
                    if !sleep_while_running(interval, &running) {
                        break;
                    }
                }
                debug!("Stats collector thread finished");
            });

        match handle {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                info!(
                    "StatsCollector started (interval {}s, {})",
                    self.interval.as_secs(),
                    if self.mountpoints.is_empty() {
                        "auto-discovered mounts".to_string()
                    } else {
                        format!("{} configured mount(s)", self.mountpoints.len())
                    }
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CollectorError::SubprocessSpawn(format!("stats thread: {}", e)))
            }
        }
    }

    /// Stop polling and wait for the thread
    ///
    /// A query already in flight runs to completion first.
    pub fn stop(&mut self) -> Result<(), CollectorError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| {
                CollectorError::SubprocessTerminated("Failed to join stats thread".to_string())
            })?;
        }

        info!("StatsCollector stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one polling cycle on the calling thread
    pub fn poll_once(&self) -> PollSummary {
        Self::poll(self.source.as_ref(), &self.machine, &self.mountpoints)
    }

    fn poll(
        source: &dyn BtrfsSource,
        machine: &AlertStateMachine,
        configured: &[PathBuf],
    ) -> PollSummary {
        let mut summary = PollSummary::default();

        let mounts = if configured.is_empty() {
            match source.discover_mounts() {
                Ok(mounts) => {
                    if mounts.is_empty() {
                        warn!("No btrfs mount points found");
                    }
                    mounts
                }
                Err(e) => {
                    error!("Failed to discover btrfs mount points: {}", e);
                    Vec::new()
                }
            }
        } else {
            configured.to_vec()
        };

        for mount in &mounts {
            summary.mounts_checked += 1;
            match source.device_stats(mount) {
                Ok(stats) => {
                    let total = aggregate_errors(&stats);
                    debug!(
                        "{}: {} error(s) across {} device(s)",
                        mount.display(),
                        total,
                        stats.len()
                    );
                    machine.observe_error_count(&mount.display().to_string(), total);
                }
                Err(e) => {
                    summary.mounts_failed += 1;
                    error!("Failed to query device stats for {}: {}", mount.display(), e);
                }
            }
        }

        match source.list_groups() {
            Ok(groups) => {
                for group in &groups {
                    summary.groups_checked += 1;
                    match source.group_missing(group) {
                        Ok(missing) => {
                            machine.observe_missing(group, missing);
                        }
                        Err(e) => {
                            summary.groups_failed += 1;
                            error!("Failed to check missing devices of {}: {}", group, e);
                        }
                    }
                }
            }
            Err(e) => error!("Failed to list btrfs filesystems: {}", e),
        }

        summary
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
