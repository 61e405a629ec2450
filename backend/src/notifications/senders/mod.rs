use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::models::OutboundNotification;

pub mod webhook;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
}

/// A notification channel. Implementations register by name and exactly one
/// is active at a time.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &OutboundNotification) -> Result<(), SenderError>;
}

/// Logs notifications and delivers nothing.
pub struct EmptySender;

#[async_trait]
impl NotificationSender for EmptySender {
    fn name(&self) -> &'static str {
        "empty"
    }

    async fn send(&self, notification: &OutboundNotification) -> Result<(), SenderError> {
        info!(
            event = %notification.event,
            clients = ?notification.clients,
            "{} {}",
            notification.emoji,
            notification.message
        );
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct SenderRegistry {
    senders: HashMap<&'static str, Arc<dyn NotificationSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `empty` sender.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EmptySender));
        registry
    }

    /// Adds a sender, replacing any previous one with the same name.
    pub fn register(&mut self, sender: Arc<dyn NotificationSender>) {
        self.senders.insert(sender.name(), sender);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NotificationSender>> {
        self.senders.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.senders.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
