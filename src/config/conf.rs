use super::sections::{BtrfsConfig, EmailConfig, JournalConfig, PushoverConfig, TimingConfig};
use crate::alerts::MAX_BACKOFF;
use crate::error::ConfigError;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/btrfs-watchd.toml";

/// Complete daemon configuration
///
/// Every recognized option is a typed field with a default. The whole
/// structure is validated once at startup by [`Config::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Mount points to poll; empty means auto-discover btrfs mounts
    pub mountpoints: Vec<PathBuf>,
    /// Host tag override for notification subjects
    pub hostname: Option<String>,
    pub timing: TimingConfig,
    pub journal: JournalConfig,
    pub btrfs: BtrfsConfig,
    pub email: EmailConfig,
    pub pushover: PushoverConfig,
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this structure,
    /// and `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timing = &self.timing;
        for (name, value) in [
            ("timing.stats_interval_seconds", timing.stats_interval_seconds),
            ("timing.report_interval_seconds", timing.report_interval_seconds),
            ("timing.initial_backoff_seconds", timing.initial_backoff_seconds),
            ("journal.restart_initial_seconds", self.journal.restart_initial_seconds),
            ("journal.restart_max_seconds", self.journal.restart_max_seconds),
            ("pushover.timeout_seconds", self.pushover.timeout_seconds),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be greater than zero", name)));
            }
        }

        if timing.initial_backoff() > MAX_BACKOFF {
            return Err(invalid(format!(
                "timing.initial_backoff_seconds must not exceed {}",
                MAX_BACKOFF.as_secs()
            )));
        }

        if self.journal.restart_initial_seconds > self.journal.restart_max_seconds {
            return Err(invalid(
                "journal.restart_initial_seconds must not exceed journal.restart_max_seconds",
            ));
        }

        if self.journal.command.is_empty() || self.journal.command[0].trim().is_empty() {
            return Err(invalid("journal.command must name a program"));
        }

        if self.journal.subsystem.trim().is_empty() {
            return Err(invalid("journal.subsystem must not be empty"));
        }

        if self.btrfs.binary.trim().is_empty() {
            return Err(invalid("btrfs.binary must not be empty"));
        }

        if let Some(ref hostname) = self.hostname {
            if hostname.trim().is_empty() {
                return Err(invalid("hostname must not be empty when set"));
            }
        }

        match (&self.email.sender, self.email.recipients.is_empty()) {
            (Some(_), true) => {
                return Err(invalid("email.sender is set but email.recipients is empty"));
            }
            (None, false) => {
                return Err(invalid("email.recipients is set but email.sender is missing"));
            }
            _ => {}
        }
        match (&self.email.smtp_server, &self.email.sender) {
            (None, Some(_)) => {
                return Err(invalid("email.sender is set but email.smtp_server is missing"));
            }
            (Some(_), None) => {
                return Err(invalid("email.smtp_server is set but email.sender is missing"));
            }
            (Some(server), Some(_)) if server.trim().is_empty() => {
                return Err(invalid("email.smtp_server must not be empty"));
            }
            _ => {}
        }
        if self.email.smtp_port == 0 {
            return Err(invalid("email.smtp_port must be greater than 0"));
        }
        if self.email.timeout_seconds == 0 {
            return Err(invalid("email.timeout_seconds must be greater than 0"));
        }
        if self.email.smtp_login.is_some() && self.email.smtp_password.is_none() {
            return Err(invalid("email.smtp_login is set but email.smtp_password is missing"));
        }
        for address in self
            .email
            .sender
            .iter()
            .chain(self.email.recipients.iter())
        {
            if !address.contains('@') || address.trim() != address {
                return Err(invalid(format!("not a mail address: {:?}", address)));
            }
        }

        if self.pushover.application_key.is_some() != self.pushover.user_key.is_some() {
            return Err(invalid(
                "pushover.application_key and pushover.user_key must be set together",
            ));
        }

        Ok(())
    }

    /// True when mount points are discovered from the mount table
    pub fn auto_discover_mounts(&self) -> bool {
        self.mountpoints.is_empty()
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
