use super::channels::NotificationChannel;
use super::mail::MailChannel;
use super::pushover::PushoverChannel;
use crate::config::Config;
use crate::error::NotifyError;
use crate::events::{Alert, NotificationEvent, Priority};
use chrono::Utc;
use log::{debug, error, info, warn};

/// Fans notifications out to every configured channel
///
/// The notifier tags subjects with the host identifier and hands each channel
/// a body shortened to that channel's line limit. A failing channel is logged
/// and never stops the remaining channels from trying.
pub struct Notifier {
    hostname: String,
    channels: Vec<Box<dyn NotificationChannel>>,
}

impl Notifier {
    /// Create a notifier over an explicit set of channels
    pub fn new(hostname: impl Into<String>, channels: Vec<Box<dyn NotificationChannel>>) -> Self {
        Self {
            hostname: hostname.into(),
            channels,
        }
    }

    /// Build the notifier and its channels from configuration
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` if a mail address does not parse or a channel's
    /// client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, NotifyError> {
        let hostname = config
            .hostname
            .clone()
            .or_else(system_hostname)
            .unwrap_or_else(|| "localhost".to_string());

        let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();

        if let Some(mail) = MailChannel::from_config(&config.email)? {
            info!(
                "Mail notifications enabled for {} recipient(s) via {}:{}",
                config.email.recipients.len(),
                config.email.smtp_server.as_deref().unwrap_or_default(),
                config.email.smtp_port
            );
            channels.push(Box::new(mail));
        } else {
            debug!("No email configured");
        }

        if config.pushover.is_enabled() {
            channels.push(Box::new(PushoverChannel::new(&config.pushover)?));
            info!("Pushover notifications enabled");
        } else {
            debug!("No pushover configuration");
        }

        if channels.is_empty() {
            warn!("No notification channel configured; alerts will only be logged");
        }

        Ok(Self::new(hostname, channels))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Prefix the subject with the host identifier unless it already names the host
    pub fn tag_subject(&self, subject: &str) -> String {
        if subject.contains(&self.hostname) {
            subject.to_string()
        } else {
            format!("[{}] {}", self.hostname, subject)
        }
    }

    /// Send one notification through every channel
    ///
    /// # Returns
    ///
    /// Number of channels that accepted the notification.
    pub fn send(&self, subject: &str, lines: &[String], priority: Priority) -> usize {
        let event = NotificationEvent {
            timestamp: Utc::now(),
            subject: self.tag_subject(subject),
            lines: lines.to_vec(),
            priority,
            hostname_tag: self.hostname.clone(),
        };

        info!(
            "Sending following report ({} priority):\n\n\t{}\n\t{}",
            priority,
            event.subject,
            event.lines.join("\n\t")
        );

        let mut delivered = 0;
        for channel in &self.channels {
            let body =
                fit_lines(&event.lines, channel.line_limit(), channel.char_limit()).join("\n");
            match channel.deliver(&event, &body) {
                Ok(()) => {
                    debug!("{} notification sent", channel.name());
                    delivered += 1;
                }
                Err(e) => {
                    error!("Failed to send {} notification: {}", channel.name(), e);
                }
            }
        }
        delivered
    }

    pub fn send_alert(&self, alert: &Alert) -> usize {
        self.send(&alert.subject, &alert.lines, alert.priority)
    }
}

/// Keep only the last `limit` lines, appending a marker when lines were dropped
pub fn truncate_lines(lines: &[String], limit: usize) -> Vec<String> {
    fit_lines(lines, limit, None)
}

/// Keep the newest lines that fit both a line and a character budget
///
/// Whole lines are dropped from the front until at most `limit` remain and,
/// when `max_chars` is set, the newline-joined body fits. The omission marker
/// counts every dropped line and always stays at the end.
pub fn fit_lines(lines: &[String], limit: usize, max_chars: Option<usize>) -> Vec<String> {
    let mut omitted = lines.len().saturating_sub(limit);
    loop {
        let kept = with_omission_marker(lines, omitted);
        let fits = max_chars.map_or(true, |max| joined_len(&kept) <= max);
        if fits || omitted == lines.len() {
            return kept;
        }
        omitted += 1;
    }
}

fn with_omission_marker(lines: &[String], omitted: usize) -> Vec<String> {
    let mut kept = lines[omitted..].to_vec();
    if omitted > 0 {
        kept.push(format!("... {} lines omitted ...", omitted));
    }
    kept
}

/// Character count of `lines` joined with newlines
fn joined_len(lines: &[String]) -> usize {
    let chars: usize = lines.iter().map(|line| line.chars().count()).sum();
    chars + lines.len().saturating_sub(1)
}

/// Kernel host name, if it can be read
pub fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the pointer and length describe a writable buffer we own.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return None;
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_fitted_body_respects_budgets(lines: Vec<String>, limit: u8, max_chars: u16) -> bool {
        let limit = usize::from(limit.max(1));
        let max_chars = usize::from(max_chars).max(40);
        let kept = fit_lines(&lines, limit, Some(max_chars));
        let body = kept.join("\n");

        let omitted_any = kept.len() <= lines.len() && kept[..] != lines[..];
        let marker_ok = !omitted_any || body.ends_with(" lines omitted ...");
        // Only the marker may exceed the budget, when every line was dropped
        let fits = body.chars().count() <= max_chars || kept.len() == 1;
        marker_ok && fits && kept.len() <= limit + 1
    }

    #[quickcheck]
    fn prop_kept_lines_are_the_newest(lines: Vec<String>, limit: u8) -> bool {
        let kept = truncate_lines(&lines, usize::from(limit));
        let content = kept.len().min(lines.len().min(usize::from(limit)));
        kept[..content] == lines[lines.len() - content..]
    }
}
