/// Channel trait shared by every delivery backend
pub mod channels;
/// Mail delivery over SMTP
pub mod mail;
/// Fan-out, host tagging and per-channel truncation
pub mod notifier;
/// Pushover push delivery
pub mod pushover;

pub use channels::NotificationChannel;
pub use mail::{MailChannel, MAIL_LINE_LIMIT};
pub use notifier::{fit_lines, system_hostname, truncate_lines, Notifier};
pub use pushover::{PushoverChannel, PUSH_LINE_LIMIT};
