/// Error types for the watchdog
pub mod error;

/// Alert, notification and device-stats data model
pub mod events;

/// Configuration management
pub mod config;

/// Alert state machine with escalating debounce
pub mod alerts;

/// Journal buffer and coalesced report scheduling
pub mod aggregator;

/// Journal and device-stats collectors
pub mod collectors;

/// Notification dispatch and delivery channels
pub mod notifications;

// Re-export commonly used types
pub use error::{CollectorError, ConfigError, NotifyError};
