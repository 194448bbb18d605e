use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Polling periods and debounce bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// How often device error counters and missing flags are polled
    pub stats_interval_seconds: u64,
    /// How often the journal buffer is considered for a report
    pub report_interval_seconds: u64,
    /// Extra wait before flushing the journal buffer, to catch related lines
    pub journal_grace_seconds: u64,
    /// First debounce window after an alert; doubles up to 24h
    pub initial_backoff_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stats_interval_seconds: 600,
            report_interval_seconds: 600,
            journal_grace_seconds: 60,
            initial_backoff_seconds: 3600,
        }
    }
}

impl TimingConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_seconds)
    }

    pub fn journal_grace(&self) -> Duration {
        Duration::from_secs(self.journal_grace_seconds)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_seconds)
    }
}

/// Kernel journal stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalConfig {
    /// Command producing the live kernel log, one message per line
    pub command: Vec<String>,
    /// Subsystem name a line must mention to be relevant (case-insensitive)
    pub subsystem: String,
    /// First delay before restarting a terminated stream
    pub restart_initial_seconds: u64,
    /// Ceiling of the restart delay
    pub restart_max_seconds: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "journalctl".to_string(),
                "-f".to_string(),
                "-t".to_string(),
                "kernel".to_string(),
            ],
            subsystem: "btrfs".to_string(),
            restart_initial_seconds: 1,
            restart_max_seconds: 60,
        }
    }
}

/// Where and how the btrfs tooling is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BtrfsConfig {
    /// `btrfs` executable
    pub binary: String,
    /// Run external commands through `sudo -n`
    pub use_sudo: bool,
    /// Root of the per-filesystem sysfs tree
    pub sysfs_root: PathBuf,
    /// Mount table used for auto-discovery
    pub mounts_file: PathBuf,
}

impl Default for BtrfsConfig {
    fn default() -> Self {
        Self {
            binary: "btrfs".to_string(),
            use_sudo: false,
            sysfs_root: PathBuf::from("/sys/fs/btrfs"),
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }
}

/// Mail channel, delivered over SMTP
///
/// Port 465 means TLS from the first byte; other ports upgrade with STARTTLS
/// when the server offers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    /// Login name; the sender address is used when only a password is set
    pub smtp_login: Option<String>,
    pub smtp_password: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// Accept invalid or self-signed server certificates
    pub ignore_ssl_errors: bool,
    pub timeout_seconds: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: None,
            smtp_port: 587,
            smtp_login: None,
            smtp_password: None,
            sender: None,
            recipients: Vec::new(),
            ignore_ssl_errors: false,
            timeout_seconds: 30,
        }
    }
}

impl EmailConfig {
    pub fn is_enabled(&self) -> bool {
        self.smtp_server.is_some() && self.sender.is_some() && !self.recipients.is_empty()
    }

    /// Name to authenticate with, if a password is configured
    pub fn login(&self) -> Option<&str> {
        self.smtp_password.as_ref()?;
        self.smtp_login.as_deref().or(self.sender.as_deref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Pushover push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushoverConfig {
    pub application_key: Option<String>,
    pub user_key: Option<String>,
    pub api_url: String,
    pub timeout_seconds: u64,
}

impl Default for PushoverConfig {
    fn default() -> Self {
        Self {
            application_key: None,
            user_key: None,
            api_url: "https://api.pushover.net/1/messages.json".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl PushoverConfig {
    pub fn is_enabled(&self) -> bool {
        self.application_key.is_some() && self.user_key.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
