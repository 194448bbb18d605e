use crate::error::NotifyError;
use crate::events::NotificationEvent;

/// A way of getting a notification in front of a human
///
/// Implementations deliver one already-truncated body. Each channel reports
/// its own line limit so the notifier can shorten the body per channel.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationChannel: Send + Sync {
    /// Short channel name used in log messages
    fn name(&self) -> &'static str;

    /// Maximum number of body lines this channel carries
    fn line_limit(&self) -> usize;

    /// Maximum body length in characters, if the channel has one
    fn char_limit(&self) -> Option<usize> {
        None
    }

    /// Deliver the event with the given body text
    fn deliver(&self, event: &NotificationEvent, body: &str) -> Result<(), NotifyError>;
}

/// Channel that records every delivery, for tests
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct RecordingChannel {
    deliveries: std::sync::Arc<std::sync::Mutex<Vec<(NotificationEvent, String)>>>,
    /// Pauses applied before recording, one per delivery, front first
    delays: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<std::time::Duration>>>,
    limit: usize,
    fail: bool,
}

#[cfg(test)]
impl RecordingChannel {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            deliveries: Default::default(),
            delays: Default::default(),
            limit,
            fail: false,
        }
    }

    /// A channel whose first deliveries take the given times to complete
    pub(crate) fn with_delays(limit: usize, delays: Vec<std::time::Duration>) -> Self {
        let channel = Self::new(limit);
        channel.delays.lock().unwrap().extend(delays);
        channel
    }

    /// A channel that records the attempt and then reports failure
    pub(crate) fn failing(limit: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(limit)
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub(crate) fn events(&self) -> Vec<NotificationEvent> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub(crate) fn bodies(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn subjects(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.subject).collect()
    }
}

#[cfg(test)]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn line_limit(&self) -> usize {
        self.limit
    }

    fn deliver(&self, event: &NotificationEvent, body: &str) -> Result<(), NotifyError> {
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((event.clone(), body.to_string()));
        if self.fail {
            Err(NotifyError::DeliveryFailed("recording channel told to fail".to_string()))
        } else {
            Ok(())
        }
    }
}
