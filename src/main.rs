use anyhow::{Context, Result};
use btrfs_watchd::aggregator::{JournalBuffer, ReportScheduler};
use btrfs_watchd::alerts::AlertStateMachine;
use btrfs_watchd::collectors::{JournalCollector, StatsCollector, SystemBtrfs};
use btrfs_watchd::config::{Config, DEFAULT_CONFIG_PATH};
use btrfs_watchd::error::{CollectorError, ConfigError};
use btrfs_watchd::events::Priority;
use btrfs_watchd::notifications::Notifier;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Command-line arguments for the btrfs watchdog
#[derive(Parser)]
#[command(
    name = "btrfs-watchd",
    about = "Btrfs health watchdog - kernel log and device error monitoring with debounced alerts",
    long_about = "Follows the kernel journal for btrfs errors and warnings, polls per-device error \
                  counters and missing-device flags, and notifies operators by mail and push with \
                  escalating debounce."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format, default /etc/btrfs-watchd.toml)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable debug logging output")]
    verbose: bool,

    /// Send a test notification and exit
    #[arg(long, help = "Send a test notification through every configured channel and exit")]
    test_notification: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// A missing config file is allowed and falls back to defaults; a path
    /// that exists but is not a file is rejected.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() && !config_path.is_file() {
                return Err(format!(
                    "Configuration path is not a file: {}",
                    config_path.display()
                ));
            }
        }
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

/// Owns the shared state and the three long-lived workers
///
/// The journal collector fills the buffer, the report scheduler drains it,
/// and the stats collector feeds the state machine. All of them share one
/// notifier through the state machine.
pub struct Watchdog {
    notifier: Arc<Notifier>,
    journal_collector: JournalCollector,
    stats_collector: StatsCollector,
    report_scheduler: ReportScheduler,

    /// Shutdown signal
    shutdown_sender: Sender<()>,
    shutdown_receiver: Receiver<()>,
}

impl Watchdog {
    /// Wire up every component from configuration without starting anything
    pub fn new(config: &Config) -> Result<Self> {
        let notifier = Arc::new(
            Notifier::from_config(config).context("Failed to set up notification channels")?,
        );
        info!("Reporting as host {}", notifier.hostname());

        let machine = Arc::new(AlertStateMachine::new(
            Arc::clone(&notifier),
            config.timing.initial_backoff(),
        ));
        let buffer = Arc::new(JournalBuffer::new());

        let journal_collector =
            JournalCollector::new(&config.journal, config.btrfs.use_sudo, Arc::clone(&buffer))
                .context("Failed to set up journal collector")?;

        let stats_collector = StatsCollector::new(
            Arc::new(SystemBtrfs::from_config(&config.btrfs)),
            Arc::clone(&machine),
            config.mountpoints.clone(),
            config.timing.stats_interval(),
        );

        let report_scheduler = ReportScheduler::new(
            machine,
            buffer,
            config.timing.report_interval(),
            config.timing.journal_grace(),
        );

        let (shutdown_sender, shutdown_receiver) = mpsc::channel();

        Ok(Self {
            notifier,
            journal_collector,
            stats_collector,
            report_scheduler,
            shutdown_sender,
            shutdown_receiver,
        })
    }

    /// Load configuration, falling back to defaults when the file is absent
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            warn!(
                "Configuration file '{}' not found, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Config::from_file(path)
    }

    /// Start all workers
    pub fn start(&mut self) -> Result<(), CollectorError> {
        info!("Starting watchdog components");
        self.journal_collector.start()?;
        self.stats_collector.start()?;
        self.report_scheduler.start()?;
        Ok(())
    }

    /// Stop all workers, reporting the first failure
    pub fn stop(&mut self) -> Result<(), CollectorError> {
        info!("Stopping watchdog components");
        let results = [
            self.report_scheduler.stop(),
            self.stats_collector.stop(),
            self.journal_collector.stop(),
        ];
        results.into_iter().collect()
    }

    /// Block until a shutdown signal arrives
    pub fn wait_for_shutdown(&self) {
        if self.shutdown_receiver.recv().is_err() {
            warn!("Shutdown channel closed");
        }
        info!("Shutdown signal received");
    }

    pub fn shutdown_sender(&self) -> Sender<()> {
        self.shutdown_sender.clone()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

/// Send one test notification through every configured channel
///
/// # Returns
///
/// `true` if at least one channel delivered it
fn send_test_notification(notifier: &Notifier) -> bool {
    let lines = vec![format!(
        "This is a test notification from btrfs-watchd on {}",
        notifier.hostname()
    )];
    let delivered = notifier.send("Test notification", &lines, Priority::Normal);
    info!(
        "Test notification delivered by {} of {} channel(s)",
        delivered,
        notifier.channel_count()
    );
    delivered > 0
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

fn run(cli: &Cli) -> Result<bool> {
    cli.validate().map_err(anyhow::Error::msg)?;

    let config_path = cli.config_path();
    let config = Watchdog::load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let mut watchdog = Watchdog::new(&config)?;

    if cli.test_notification {
        return Ok(send_test_notification(watchdog.notifier()));
    }

    watchdog.start().context("Failed to start watchdog")?;

    let shutdown_sender = watchdog.shutdown_sender();
    ctrlc::set_handler(move || {
        info!("Received termination signal, shutting down");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("Failed to install signal handler")?;

    info!("btrfs-watchd is running");
    watchdog.wait_for_shutdown();

    watchdog.stop().context("Error during shutdown")?;
    info!("btrfs-watchd shutdown complete");
    Ok(true)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn cli(config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            verbose: false,
            test_notification: false,
        }
    }

    #[test]
    fn test_cli_parses_flags() {
        let parsed =
            Cli::try_parse_from(["btrfs-watchd", "-c", "/tmp/w.toml", "-v", "--test-notification"])
                .unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/w.toml")));
        assert!(parsed.verbose);
        assert!(parsed.test_notification);
    }

    #[test]
    fn test_cli_default_config_path() {
        assert_eq!(cli(None).config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_cli_validation_with_existing_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(cli(Some(file.path().to_path_buf())).validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        let cli = cli(Some(PathBuf::from("/nonexistent/btrfs-watchd.toml")));
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = TempDir::new().unwrap();
        assert!(cli(Some(dir.path().to_path_buf())).validate().is_err());
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = Watchdog::load_config(Path::new("/nonexistent/btrfs-watchd.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_invalid_file_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[timing]\nstats_interval_seconds = 0").unwrap();
        assert!(matches!(
            Watchdog::load_config(file.path()),
            Err(ConfigError::ValidationError(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "unknown_key = true").unwrap();
        assert!(Watchdog::load_config(file.path()).is_err());
    }

    #[test]
    fn test_load_config_reads_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "mountpoints = [\"/srv\"]\nhostname = \"nas01\"").unwrap();
        let config = Watchdog::load_config(file.path()).unwrap();
        assert_eq!(config.mountpoints, vec![PathBuf::from("/srv")]);
        assert_eq!(config.hostname.as_deref(), Some("nas01"));
    }

    #[test]
    fn test_watchdog_wiring_with_defaults() {
        let config = Config {
            hostname: Some("nas01".to_string()),
            ..Config::default()
        };
        let watchdog = Watchdog::new(&config).unwrap();
        assert_eq!(watchdog.notifier().hostname(), "nas01");
        assert_eq!(watchdog.notifier().channel_count(), 0);
    }

    #[test]
    fn test_test_notification_without_channels_fails() {
        let notifier = Notifier::new("nas01", Vec::new());
        assert!(!send_test_notification(&notifier));
    }

    #[test]
    fn test_wait_for_shutdown_returns_on_signal() {
        let watchdog = Watchdog::new(&Config::default()).unwrap();
        watchdog.shutdown_sender().send(()).unwrap();
        watchdog.wait_for_shutdown();
    }
}
