/// Kernel journal stream collector
pub mod journal_collector;

/// Periodic device-stats and missing-device poller
pub mod stats_collector;

/// Access to btrfs tooling, sysfs and the mount table
pub mod btrfs;

pub use btrfs::{BtrfsSource, SystemBtrfs};
pub use journal_collector::{JournalCollector, JournalFilter};
pub use stats_collector::StatsCollector;

use std::ffi::OsStr;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Sleep for `duration` in short slices, giving up early once `running` clears
///
/// # Returns
///
/// `true` if the full duration elapsed while still running
pub fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(SLEEP_SLICE);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    running.load(Ordering::SeqCst)
}

/// Build a command, optionally prefixed with non-interactive sudo
pub(crate) fn build_command<I, S>(program: &str, args: I, use_sudo: bool) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if use_sudo {
        let mut command = Command::new("sudo");
        command.arg("-n").arg(program).args(args);
        command
    } else {
        let mut command = Command::new(program);
        command.args(args);
        command
    }
}

/// Render a command line for log and error messages
pub(crate) fn describe_command(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_sleep_while_running_full_duration() {
        let running = AtomicBool::new(true);
        let start = Instant::now();
        assert!(sleep_while_running(Duration::from_millis(150), &running));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_sleep_while_running_stops_early() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(false, Ordering::SeqCst);
        });

        let start = Instant::now();
        assert!(!sleep_while_running(Duration::from_secs(30), &running));
        assert!(start.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();
    }

    #[test]
    fn test_sleep_zero_reports_running_state() {
        assert!(sleep_while_running(Duration::ZERO, &AtomicBool::new(true)));
        assert!(!sleep_while_running(Duration::ZERO, &AtomicBool::new(false)));
    }

    #[test]
    fn test_build_command_with_and_without_sudo() {
        let args = vec!["device".to_string(), "stats".to_string()];

        let plain = build_command("btrfs", &args, false);
        assert_eq!(describe_command(&plain), "btrfs device stats");

        let elevated = build_command("btrfs", &args, true);
        assert_eq!(describe_command(&elevated), "sudo -n btrfs device stats");
    }
}
