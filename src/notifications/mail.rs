use super::channels::NotificationChannel;
use crate::config::EmailConfig;
use crate::error::NotifyError;
use crate::events::NotificationEvent;
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use log::{debug, info, warn};
use std::time::SystemTime;

/// Maximum number of body lines in a mail
pub const MAIL_LINE_LIMIT: usize = 1000;

/// Port on which the server expects TLS from the first byte
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// `X-Priority` header understood by most mail clients (1 high, 3 normal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct XPriority(u8);

impl Header for XPriority {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Priority")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let level = s.split_whitespace().next().unwrap_or_default().parse()?;
        Ok(Self(level))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.to_string())
    }
}

/// Mail channel speaking SMTP to the configured relay
///
/// Port 465 uses TLS from the start; any other port upgrades with STARTTLS
/// when the server offers it. One message is sent per recipient so that a
/// rejected address does not hold back the others.
pub struct MailChannel {
    transport: SmtpTransport,
    sender: Mailbox,
    recipients: Vec<Mailbox>,
}

impl MailChannel {
    pub fn new(transport: SmtpTransport, sender: Mailbox, recipients: Vec<Mailbox>) -> Self {
        Self {
            transport,
            sender,
            recipients,
        }
    }

    /// Build the channel if mail is configured
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::AddressError` for an unparsable address and
    /// `NotifyError::SmtpError` if the TLS parameters cannot be built.
    pub fn from_config(config: &EmailConfig) -> Result<Option<Self>, NotifyError> {
        let (Some(server), Some(sender)) = (&config.smtp_server, &config.sender) else {
            return Ok(None);
        };
        if config.recipients.is_empty() {
            return Ok(None);
        }

        let sender: Mailbox = sender.parse()?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| r.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self::new(build_transport(server, config)?, sender, recipients)))
    }

    /// Render the message for one recipient
    fn compose(
        &self,
        recipient: &Mailbox,
        event: &NotificationEvent,
        body: &str,
    ) -> Result<Message, NotifyError> {
        let message = Message::builder()
            .from(self.sender.clone())
            .to(recipient.clone())
            .subject(header_value(&event.subject))
            .date(SystemTime::from(event.timestamp))
            .header(XPriority(event.priority.mail_header()))
            .singlepart(SinglePart::plain(body.to_string()))?;
        Ok(message)
    }
}

fn build_transport(server: &str, config: &EmailConfig) -> Result<SmtpTransport, NotifyError> {
    if config.ignore_ssl_errors {
        warn!("Configured to skip TLS certificate checks on SMTP");
    }
    let tls_parameters = TlsParameters::builder(server.to_string())
        .dangerous_accept_invalid_certs(config.ignore_ssl_errors)
        .dangerous_accept_invalid_hostnames(config.ignore_ssl_errors)
        .build()?;

    let tls = if config.smtp_port == IMPLICIT_TLS_PORT {
        Tls::Wrapper(tls_parameters)
    } else {
        Tls::Opportunistic(tls_parameters)
    };

    let mut builder = SmtpTransport::builder_dangerous(server)
        .port(config.smtp_port)
        .timeout(Some(config.timeout()))
        .tls(tls);
    if let (Some(login), Some(password)) = (config.login(), &config.smtp_password) {
        builder = builder.credentials(Credentials::new(login.to_string(), password.clone()));
    }
    Ok(builder.build())
}

impl NotificationChannel for MailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn line_limit(&self) -> usize {
        MAIL_LINE_LIMIT
    }

    fn deliver(&self, event: &NotificationEvent, body: &str) -> Result<(), NotifyError> {
        let mut failures = Vec::new();

        for recipient in &self.recipients {
            let sent = self
                .compose(recipient, event, body)
                .and_then(|message| Ok(self.transport.send(&message)?));
            match sent {
                Ok(_) => info!("Email successfully sent to {}", recipient),
                Err(e) => {
                    warn!("Email to {} failed: {}", recipient, e);
                    failures.push(format!("{}: {}", recipient, e));
                }
            }
        }

        if failures.is_empty() {
            debug!("Email delivered to {} recipient(s)", self.recipients.len());
            Ok(())
        } else {
            Err(NotifyError::DeliveryFailed(failures.join("; ")))
        }
    }
}

// Header values must stay on one line.
fn header_value(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
