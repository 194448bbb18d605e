/// Top-level configuration, loading and validation
pub mod conf;

/// Per-concern configuration sections
pub mod sections;

pub use conf::{Config, DEFAULT_CONFIG_PATH};
pub use sections::{BtrfsConfig, EmailConfig, JournalConfig, PushoverConfig, TimingConfig};
