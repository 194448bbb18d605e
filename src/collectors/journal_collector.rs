use super::{build_command, describe_command, sleep_while_running};
use crate::aggregator::JournalBuffer;
use crate::config::JournalConfig;
use crate::error::CollectorError;
use log::{debug, error, info, warn};
use regex::Regex;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest line kept whole; a longer run without a newline is cut here
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Decides which kernel lines are worth reporting
///
/// A line is relevant when it names the subsystem (case-insensitive) and
/// mentions an error or a warning.
#[derive(Debug, Clone)]
pub struct JournalFilter {
    subsystem: String,
    severity: Regex,
}

impl JournalFilter {
    pub fn new(subsystem: &str) -> Result<Self, CollectorError> {
        let severity = Regex::new(r"(?i)error|warn")
            .map_err(|e| CollectorError::ParseError(format!("journal filter: {}", e)))?;
        Ok(Self {
            subsystem: subsystem.to_lowercase(),
            severity,
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        line.to_lowercase().contains(&self.subsystem) && self.severity.is_match(line)
    }
}

/// Follows the kernel journal and buffers relevant lines
///
/// Runs the configured follow command as a subprocess and restarts it with
/// exponential backoff whenever it exits or fails. Matching lines are trimmed
/// and appended to the shared `JournalBuffer`; the collector never waits on
/// whoever drains the buffer.
pub struct JournalCollector {
    /// Follow command and its arguments
    command: Vec<String>,
    /// Prefix the command with `sudo -n`
    use_sudo: bool,
    filter: Arc<JournalFilter>,
    buffer: Arc<JournalBuffer>,
    restart_initial: Duration,
    restart_max: Duration,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl JournalCollector {
    /// Create a collector feeding `buffer`
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::SubprocessSpawn` if the command is empty.
    pub fn new(
        config: &JournalConfig,
        use_sudo: bool,
        buffer: Arc<JournalBuffer>,
    ) -> Result<Self, CollectorError> {
        if config.command.is_empty() {
            return Err(CollectorError::SubprocessSpawn(
                "journal command is empty".to_string(),
            ));
        }

        Ok(Self {
            command: config.command.clone(),
            use_sudo,
            filter: Arc::new(JournalFilter::new(&config.subsystem)?),
            buffer,
            restart_initial: Duration::from_secs(config.restart_initial_seconds),
            restart_max: Duration::from_secs(config.restart_max_seconds),
            thread_handle: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start following the journal
    ///
    /// The first subprocess is spawned here so that a missing binary or a
    /// denied sudo is reported to the caller instead of only being logged.
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::SubprocessSpawn` if the initial subprocess cannot be started.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let first = match self.spawn_stream() {
            Ok(child) => child,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let supervisor = Supervisor {
            command: self.command.clone(),
            use_sudo: self.use_sudo,
            filter: Arc::clone(&self.filter),
            buffer: Arc::clone(&self.buffer),
            restart_initial: self.restart_initial,
            restart_max: self.restart_max,
            running: Arc::clone(&self.running),
        };

        let handle = thread::Builder::new()
            .name("journal-collector".to_string())
            .spawn(move || supervisor.run(first));

        match handle {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                info!("JournalCollector started: {}", self.command.join(" "));
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CollectorError::SubprocessSpawn(format!("journal thread: {}", e)))
            }
        }
    }

    /// Stop the collector and wait for its thread
    ///
    /// The current subprocess is killed.
    pub fn stop(&mut self) -> Result<(), CollectorError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| {
                CollectorError::SubprocessTerminated("Failed to join journal thread".to_string())
            })?;
        }

        info!("JournalCollector stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_stream(&self) -> Result<Child, CollectorError> {
        spawn_stream(&self.command, self.use_sudo)
    }
}

impl Drop for JournalCollector {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// State moved into the collector thread
struct Supervisor {
    command: Vec<String>,
    use_sudo: bool,
    filter: Arc<JournalFilter>,
    buffer: Arc<JournalBuffer>,
    restart_initial: Duration,
    restart_max: Duration,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    /// Keep a journal stream alive until shutdown
    fn run(self, first: Child) {
        let mut restart_delay = self.restart_initial;
        let mut pending = Some(first);

        while self.running.load(Ordering::SeqCst) {
            let spawned = match pending.take() {
                Some(child) => Ok(child),
                None => spawn_stream(&self.command, self.use_sudo),
            };

            let mut produced_lines = false;
            match spawned {
                Ok(mut child) => {
                    debug!("Journal stream subprocess running (pid {})", child.id());
                    match process_journal_stream(&mut child, &self.filter, &self.buffer, &self.running)
                    {
                        Ok(lines) => {
                            produced_lines = lines > 0;
                            match child.try_wait() {
                                Ok(Some(status)) => {
                                    warn!("Journal stream exited with status: {}", status)
                                }
                                Ok(None) => debug!("Journal stream closed its output"),
                                Err(e) => error!("Failed to check journal stream status: {}", e),
                            }
                        }
                        Err(e) => error!("Error reading journal stream: {}", e),
                    }

                    if let Err(e) = child.kill() {
                        debug!("Failed to kill journal stream subprocess: {}", e);
                    }
                    let _ = child.wait();
                }
                Err(e) => error!("Failed to spawn journal stream: {}", e),
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if produced_lines {
                restart_delay = self.restart_initial;
            }

            warn!("Restarting journal stream in {:?}", restart_delay);
            if !sleep_while_running(restart_delay, &self.running) {
                break;
            }
            restart_delay = restart_delay.saturating_mul(2).min(self.restart_max);
        }

        debug!("Journal collector thread finished");
    }
}

/// Spawn the follow command with non-blocking stdout
fn spawn_stream(command: &[String], use_sudo: bool) -> Result<Child, CollectorError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| CollectorError::SubprocessSpawn("journal command is empty".to_string()))?;

    let mut cmd = build_command(program, args, use_sudo);
    let description = describe_command(&cmd);
    debug!("Spawning journal stream: {}", description);

    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| CollectorError::SubprocessSpawn(format!("{}: {}", description, e)))?;

    // Non-blocking stdout keeps shutdown responsive while the stream is idle
    if let Some(ref stdout) = child.stdout {
        use std::os::unix::io::AsRawFd;
        let fd = stdout.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    Ok(child)
}

/// Read the subprocess output until EOF or shutdown
///
/// # Returns
///
/// The number of non-blank lines read, matching or not
fn process_journal_stream(
    child: &mut Child,
    filter: &JournalFilter,
    buffer: &JournalBuffer,
    running: &AtomicBool,
) -> Result<usize, CollectorError> {
    use std::io::Read;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CollectorError::ParseError("No stdout available".to_string()))?;

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut lines = 0;

    loop {
        if !running.load(Ordering::SeqCst) {
            debug!("Stopping journal processing due to shutdown signal");
            break;
        }

        match stdout.read(&mut chunk) {
            Ok(0) => {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    lines += handle_line(&line, filter, buffer);
                }
                debug!("Journal stream closed stdout");
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw[..pos]);
                    lines += handle_line(&line, filter, buffer);
                }
                while pending.len() >= MAX_LINE_BYTES {
                    warn!(
                        "Journal line exceeds {} bytes without a newline, splitting it",
                        MAX_LINE_BYTES
                    );
                    let raw: Vec<u8> = pending.drain(..MAX_LINE_BYTES).collect();
                    let line = String::from_utf8_lossy(&raw);
                    lines += handle_line(&line, filter, buffer);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(CollectorError::IoError(e)),
        }
    }

    Ok(lines)
}

/// Filter one line into the buffer; returns 1 for a non-blank line
fn handle_line(line: &str, filter: &JournalFilter, buffer: &JournalBuffer) -> usize {
    let line = line.trim();
    if line.is_empty() {
        return 0;
    }
    if filter.matches(line) {
        error!("{}", line);
        buffer.push(line);
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config(command: &[&str]) -> JournalConfig {
        JournalConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..JournalConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn test_filter_requires_subsystem_and_severity() {
        let filter = JournalFilter::new("btrfs").unwrap();

        assert!(filter.matches("BTRFS error (device sda1): bdev /dev/sda1 errs: wr 1, rd 0"));
        assert!(filter.matches("BTRFS warning (device sdb): csum failed root 5 ino 257"));
        assert!(filter.matches("btrfs: WARN something odd"));
        assert!(!filter.matches("BTRFS info (device sda1): disk space caching is enabled"));
        assert!(!filter.matches("usb 1-1: device descriptor read error"));
        assert!(!filter.matches(""));
    }

    #[test]
    fn test_filter_subsystem_is_case_insensitive() {
        let filter = JournalFilter::new("BtrFS").unwrap();
        assert!(filter.matches("btrfs ERROR"));
    }

    #[test]
    fn test_handle_line_trims_and_counts() {
        let filter = JournalFilter::new("btrfs").unwrap();
        let buffer = JournalBuffer::new();

        assert_eq!(handle_line("   ", &filter, &buffer), 0);
        assert_eq!(handle_line("kernel: eth0 link up", &filter, &buffer), 1);
        assert_eq!(handle_line("  BTRFS error (device sda1): x  ", &filter, &buffer), 1);

        assert_eq!(buffer.take_all(), vec!["BTRFS error (device sda1): x"]);
    }

    #[test]
    fn test_process_stream_filters_lines_in_order() {
        let filter = JournalFilter::new("btrfs").unwrap();
        let buffer = JournalBuffer::new();
        let running = AtomicBool::new(true);

        let command: Vec<String> = [
            "printf",
            "BTRFS error one\\nusb warning\\n\\nBTRFS info fine\\nBTRFS warning two\\nBTRFS error tail",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let mut child = spawn_stream(&command, false).unwrap();

        let lines = process_journal_stream(&mut child, &filter, &buffer, &running).unwrap();
        let _ = child.wait();

        assert_eq!(lines, 5);
        assert_eq!(
            buffer.take_all(),
            vec!["BTRFS error one", "BTRFS warning two", "BTRFS error tail"]
        );
    }

    #[test]
    fn test_process_stream_replaces_invalid_utf8() {
        let filter = JournalFilter::new("btrfs").unwrap();
        let buffer = JournalBuffer::new();
        let running = AtomicBool::new(true);

        let command: Vec<String> = ["printf", "BTRFS error \\377\\n"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut child = spawn_stream(&command, false).unwrap();
        process_journal_stream(&mut child, &filter, &buffer, &running).unwrap();
        let _ = child.wait();

        assert_eq!(buffer.take_all(), vec!["BTRFS error \u{FFFD}"]);
    }

    #[test]
    fn test_process_stream_splits_overlong_lines() {
        let filter = JournalFilter::new("btrfs").unwrap();
        let buffer = JournalBuffer::new();
        let running = AtomicBool::new(true);

        let script = "printf 'BTRFS error '; head -c 40000 /dev/zero | tr '\\0' x; \
                      printf '\\nBTRFS warning after\\n'";
        let command: Vec<String> = ["sh", "-c", script].iter().map(|s| s.to_string()).collect();
        let mut child = spawn_stream(&command, false).unwrap();
        let lines = process_journal_stream(&mut child, &filter, &buffer, &running).unwrap();
        let _ = child.wait();

        // Two full pieces, the 7244-byte remainder, then the next real line
        assert_eq!(lines, 4);
        let buffered = buffer.take_all();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0].len(), MAX_LINE_BYTES);
        assert!(buffered[0].starts_with("BTRFS error xxx"));
        assert_eq!(buffered[1], "BTRFS warning after");
    }

    #[test]
    fn test_new_rejects_empty_command() {
        let buffer = Arc::new(JournalBuffer::new());
        assert!(JournalCollector::new(&config(&[]), false, buffer).is_err());
    }

    #[test]
    fn test_start_reports_missing_binary() {
        let buffer = Arc::new(JournalBuffer::new());
        let mut collector =
            JournalCollector::new(&config(&["/nonexistent/journalctl"]), false, buffer).unwrap();

        assert!(matches!(
            collector.start(),
            Err(CollectorError::SubprocessSpawn(_))
        ));
        assert!(!collector.is_running());
    }

    #[test]
    fn test_stream_is_restarted_after_exit() {
        let buffer = Arc::new(JournalBuffer::new());
        let mut collector = JournalCollector::new(
            &config(&["echo", "BTRFS error from a short-lived stream"]),
            false,
            Arc::clone(&buffer),
        )
        .unwrap();
        collector.restart_initial = Duration::from_millis(50);
        collector.restart_max = Duration::from_millis(200);

        collector.start().unwrap();
        assert!(collector.is_running());
        assert!(wait_for(|| buffer.len() >= 3, Duration::from_secs(10)));
        collector.stop().unwrap();
        assert!(!collector.is_running());

        assert!(buffer
            .take_all()
            .iter()
            .all(|l| l == "BTRFS error from a short-lived stream"));
    }

    #[test]
    fn test_stop_is_responsive_while_stream_idle() {
        let buffer = Arc::new(JournalBuffer::new());
        let mut collector =
            JournalCollector::new(&config(&["sleep", "30"]), false, buffer).unwrap();

        collector.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        collector.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_double_start_is_harmless() {
        let buffer = Arc::new(JournalBuffer::new());
        let mut collector =
            JournalCollector::new(&config(&["sleep", "30"]), false, buffer).unwrap();

        assert!(collector.start().is_ok());
        assert!(collector.start().is_ok());
        assert!(collector.is_running());
        assert!(collector.stop().is_ok());
    }
}
