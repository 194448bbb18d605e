use super::channels::NotificationChannel;
use crate::config::PushoverConfig;
use crate::error::NotifyError;
use crate::events::NotificationEvent;
use log::debug;
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;

/// Maximum number of body lines in a push message
pub const PUSH_LINE_LIMIT: usize = 50;

/// Pushover rejects messages longer than this many characters
const MESSAGE_CHAR_LIMIT: usize = 1024;

/// Pushover rejects titles longer than this many characters
const TITLE_CHAR_LIMIT: usize = 250;

/// Push channel delivering through the Pushover messages API
///
/// The HTTP client is async; the channel owns a small current-thread runtime
/// so it can be driven from the plain worker threads of the daemon.
pub struct PushoverChannel {
    client: Client,
    runtime: tokio::runtime::Runtime,
    api_url: String,
    application_key: String,
    user_key: String,
}

/// Response body of the messages API
#[derive(Debug, Deserialize)]
struct PushoverResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

impl PushoverChannel {
    /// Create a channel from configuration
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::DeliveryFailed` if the keys are missing, and
    /// `NotifyError::HttpError` or `NotifyError::Runtime` if the client
    /// cannot be built.
    pub fn new(config: &PushoverConfig) -> Result<Self, NotifyError> {
        Self::with_builder(config, Client::builder())
    }

    /// Create a channel with a caller-provided client builder
    pub fn with_builder(config: &PushoverConfig, builder: ClientBuilder) -> Result<Self, NotifyError> {
        let (application_key, user_key) = match (&config.application_key, &config.user_key) {
            (Some(app), Some(user)) => (app.clone(), user.clone()),
            _ => {
                return Err(NotifyError::DeliveryFailed(
                    "pushover application_key and user_key are required".to_string(),
                ))
            }
        };

        let client = builder.timeout(config.timeout()).build()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| NotifyError::Runtime(e.to_string()))?;

        Ok(Self {
            client,
            runtime,
            api_url: config.api_url.clone(),
            application_key,
            user_key,
        })
    }

    async fn post(&self, title: String, message: String, priority: i8) -> Result<(), NotifyError> {
        let params = [
            ("token", self.application_key.clone()),
            ("user", self.user_key.clone()),
            ("title", title),
            ("message", message),
            ("priority", priority.to_string()),
        ];

        let response = self.client.post(&self.api_url).form(&params).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(NotifyError::DeliveryFailed(format!(
                "Pushover API returned error {}: {}",
                status,
                text.trim()
            )));
        }

        match serde_json::from_str::<PushoverResponse>(&text) {
            Ok(parsed) if parsed.status != 1 => Err(NotifyError::DeliveryFailed(format!(
                "Pushover rejected message: {}",
                parsed.errors.join(", ")
            ))),
            _ => Ok(()),
        }
    }
}

impl NotificationChannel for PushoverChannel {
    fn name(&self) -> &'static str {
        "pushover"
    }

    fn line_limit(&self) -> usize {
        PUSH_LINE_LIMIT
    }

    fn char_limit(&self) -> Option<usize> {
        Some(MESSAGE_CHAR_LIMIT)
    }

    fn deliver(&self, event: &NotificationEvent, body: &str) -> Result<(), NotifyError> {
        let title = truncate_text(&event.subject, TITLE_CHAR_LIMIT);
        let message = truncate_text_head(body, MESSAGE_CHAR_LIMIT);
        self.runtime
            .block_on(self.post(title, message, event.priority.pushover_level()))?;
        debug!("Pushover notification sent");
        Ok(())
    }
}

/// Truncate text to at most `max_chars` characters, ending in `...` when cut
fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut result: String = text.chars().take(keep).collect();
    result.push_str("...");
    result
}

/// Keep the last `max_chars` characters of text, starting with `...` when cut
///
/// The notifier already fits whole lines into the message budget; this only
/// bites when a single line is longer than the whole budget.
fn truncate_text_head(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut result = String::from("...");
    result.extend(text.chars().skip(count - keep));
    result
}
