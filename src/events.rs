//! Core event types for the btrfs watchdog
//!
//! This module defines the data structures that flow between the collectors,
//! the alert state machine and the notification channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Delivery priority of a notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Recovery and informational messages
    Normal,
    /// Redundancy degradation and new errors
    High,
}

impl Priority {
    /// Pushover priority value (0 normal, 1 high)
    pub fn pushover_level(self) -> i8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }

    /// Value of the `X-Priority` mail header (1 highest, 3 normal)
    pub fn mail_header(self) -> u8 {
        match self {
            Priority::Normal => 3,
            Priority::High => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// An alert decided by the state machine or the report scheduler
///
/// Carries no host information; the notifier tags it on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub subject: String,
    pub lines: Vec<String>,
    pub priority: Priority,
}

impl Alert {
    pub fn new(subject: impl Into<String>, lines: Vec<String>, priority: Priority) -> Self {
        Self {
            subject: subject.into(),
            lines,
            priority,
        }
    }
}

/// A notification as handed to the channels
///
/// Constructed once per send and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    /// When the notification was dispatched
    pub timestamp: Timestamp,
    /// Subject, already tagged with the host identifier
    pub subject: String,
    /// Untruncated body lines; each channel applies its own limit
    pub lines: Vec<String>,
    pub priority: Priority,
    /// Host identifier the subject was tagged with
    pub hostname_tag: String,
}

/// Error counters of one physical device as reported by `btrfs device stats`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStats {
    pub device: String,
    #[serde(deserialize_with = "counter")]
    pub write_io_errs: u64,
    #[serde(deserialize_with = "counter")]
    pub read_io_errs: u64,
    #[serde(deserialize_with = "counter")]
    pub flush_io_errs: u64,
    #[serde(deserialize_with = "counter")]
    pub corruption_errs: u64,
    #[serde(deserialize_with = "counter")]
    pub generation_errs: u64,
}

impl DeviceStats {
    /// Sum of all five error counters
    pub fn total_errors(&self) -> u64 {
        [
            self.write_io_errs,
            self.read_io_errs,
            self.flush_io_errs,
            self.corruption_errs,
            self.generation_errs,
        ]
        .iter()
        .fold(0u64, |acc, n| acc.saturating_add(*n))
    }
}

/// Sum of the error counters across all devices of one mount point
pub fn aggregate_errors(devices: &[DeviceStats]) -> u64 {
    devices
        .iter()
        .fold(0u64, |acc, d| acc.saturating_add(d.total_errors()))
}

// Older btrfs-progs releases print counters as strings.
fn counter<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Counter {
        Number(u64),
        Text(String),
    }

    match Counter::deserialize(deserializer)? {
        Counter::Number(n) => Ok(n),
        Counter::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(values: [u64; 5]) -> DeviceStats {
        DeviceStats {
            device: "/dev/sda".to_string(),
            write_io_errs: values[0],
            read_io_errs: values[1],
            flush_io_errs: values[2],
            corruption_errs: values[3],
            generation_errs: values[4],
        }
    }

    #[test]
    fn test_total_errors_sums_all_counters() {
        assert_eq!(stats([1, 2, 3, 4, 5]).total_errors(), 15);
        assert_eq!(stats([0, 0, 0, 0, 0]).total_errors(), 0);
    }

    #[test]
    fn test_total_errors_saturates() {
        assert_eq!(stats([u64::MAX, 1, 0, 0, 0]).total_errors(), u64::MAX);
    }

    #[test]
    fn test_aggregate_errors_across_devices() {
        let devices = vec![stats([1, 0, 0, 0, 0]), stats([0, 0, 0, 2, 0])];
        assert_eq!(aggregate_errors(&devices), 3);
        assert_eq!(aggregate_errors(&[]), 0);
    }

    #[test]
    fn test_device_stats_accepts_numbers_and_strings() {
        let json = r#"{"device": "/dev/sdb", "devid": 2, "write_io_errs": 1,
            "read_io_errs": "2", "flush_io_errs": 0, "corruption_errs": " 3 ",
            "generation_errs": 0}"#;
        let parsed: DeviceStats = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.device, "/dev/sdb");
        assert_eq!(parsed.total_errors(), 6);
    }

    #[test]
    fn test_device_stats_rejects_garbage_counter() {
        let json = r#"{"device": "/dev/sdb", "write_io_errs": "lots",
            "read_io_errs": 0, "flush_io_errs": 0, "corruption_errs": 0,
            "generation_errs": 0}"#;
        assert!(serde_json::from_str::<DeviceStats>(json).is_err());
    }

    #[test]
    fn test_priority_mappings() {
        assert_eq!(Priority::High.pushover_level(), 1);
        assert_eq!(Priority::Normal.pushover_level(), 0);
        assert_eq!(Priority::High.mail_header(), 1);
        assert_eq!(Priority::Normal.mail_header(), 3);
        assert!(Priority::Normal < Priority::High);
    }

    #[test]
    fn test_priority_serialization() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
        assert_eq!(
            serde_json::to_string(&Priority::Normal).unwrap(),
            "\"normal\""
        );
    }
}
