use std::collections::HashMap;

use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::models::{NotificationEvent, OutboundNotification};
use super::senders::{SenderError, SenderRegistry};
use crate::db::entities::client;
use crate::server::config::RuntimeSettings;

pub const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),
    #[error("Unsupported notification method: {0}")]
    UnsupportedMethod(String),
    #[error("Sender error: {0}")]
    SenderError(#[from] SenderError),
}

/// Producer side of the event queue. Emitting never waits.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<NotificationEvent>,
}

impl EventSink {
    pub fn emit(&self, event: NotificationEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = event.event_type(), "Notification queue full; event dropped.");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event = event.event_type(), "Notification queue closed; event dropped.");
            }
        }
    }
}

pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<NotificationEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink { tx }, rx)
}

/// Consumes events, resolves client names and hands the result to the
/// sender selected by `notification_method`.
pub struct NotificationDispatcher {
    db: DatabaseConnection,
    senders: SenderRegistry,
    settings: watch::Receiver<RuntimeSettings>,
    events: Mutex<mpsc::Receiver<NotificationEvent>>,
}

impl NotificationDispatcher {
    pub fn new(
        db: DatabaseConnection,
        senders: SenderRegistry,
        settings: watch::Receiver<RuntimeSettings>,
        events: mpsc::Receiver<NotificationEvent>,
    ) -> Self {
        Self {
            db,
            senders,
            settings,
            events: Mutex::new(events),
        }
    }

    pub async fn run(&self) {
        info!("Notification dispatcher started.");
        let mut events = self.events.lock().await;
        while let Some(event) = events.recv().await {
            let kind = event.event_type();
            if let Err(e) = self.dispatch(&event).await {
                error!(event = kind, error = %e, "Failed to deliver notification.");
            }
        }
        info!("Notification queue closed; dispatcher exiting.");
    }

    /// Delivers one event. Returns false when the global switch is off.
    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<bool, NotificationError> {
        let (enabled, method) = {
            let settings = self.settings.borrow();
            (settings.notification_enabled, settings.notification_method.clone())
        };
        if !enabled {
            debug!(event = event.event_type(), "Notifications disabled; event skipped.");
            return Ok(false);
        }

        let sender = self
            .senders
            .get(&method)
            .ok_or_else(|| NotificationError::UnsupportedMethod(method.clone()))?;

        let names = self.client_names(&event.clients()).await?;
        let outbound = OutboundNotification::from_event(event, &names, Utc::now());
        sender.send(&outbound).await?;
        debug!(event = event.event_type(), method = %method, "Notification delivered.");
        Ok(true)
    }

    async fn client_names(&self, uuids: &[String]) -> Result<HashMap<String, String>, DbErr> {
        if uuids.is_empty() {
            return Ok(HashMap::new());
        }
        let clients = client::Entity::find()
            .filter(client::Column::Uuid.is_in(uuids.iter().cloned()))
            .all(&self.db)
            .await?;
        Ok(clients.into_iter().map(|c| (c.uuid, c.name)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::db::connect_in_memory;
    use crate::db::services::client_service;
    use crate::notifications::senders::mock::MockSender;

    async fn dispatcher(
        sender: Arc<MockSender>,
        settings: RuntimeSettings,
    ) -> (NotificationDispatcher, DatabaseConnection, watch::Sender<RuntimeSettings>) {
        let db = connect_in_memory().await.unwrap();
        let mut registry = SenderRegistry::with_defaults();
        registry.register(sender);
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (_sink, rx) = event_channel(4);
        (
            NotificationDispatcher::new(db.clone(), registry, settings_rx, rx),
            db,
            settings_tx,
        )
    }

    fn mock_settings() -> RuntimeSettings {
        RuntimeSettings {
            notification_method: "mock".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_resolves_names_and_uses_active_sender() {
        let sender = Arc::new(MockSender::default());
        let (dispatcher, db, _settings) = dispatcher(sender.clone(), mock_settings()).await;
        let c = client_service::create_client(&db, "alpha").await.unwrap();

        let delivered = dispatcher
            .dispatch(&NotificationEvent::Offline { client: c.uuid.clone() })
            .await
            .unwrap();
        assert!(delivered);

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].clients, vec!["alpha".to_string()]);
        assert_eq!(sent[0].message, "alpha is offline");
    }

    #[tokio::test]
    async fn global_switch_blocks_delivery() {
        let sender = Arc::new(MockSender::default());
        let settings = RuntimeSettings {
            notification_enabled: false,
            ..mock_settings()
        };
        let (dispatcher, _db, _settings) = dispatcher(sender.clone(), settings).await;
        let delivered = dispatcher
            .dispatch(&NotificationEvent::Online { client: "u1".into() })
            .await
            .unwrap();
        assert!(!delivered);
        assert!(sender.sent().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_method_and_sender_failures_surface() {
        let sender = Arc::new(MockSender::failing());
        let (dispatcher, _db, settings) = dispatcher(sender, mock_settings()).await;
        let event = NotificationEvent::Online { client: "u1".into() };
        assert!(matches!(
            dispatcher.dispatch(&event).await,
            Err(NotificationError::SenderError(_))
        ));

        settings.send_modify(|s| s.notification_method = "carrier-pigeon".into());
        assert!(matches!(
            dispatcher.dispatch(&event).await,
            Err(NotificationError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (sink, mut rx) = event_channel(1);
        sink.emit(NotificationEvent::Online { client: "a".into() });
        sink.emit(NotificationEvent::Online { client: "b".into() });
        assert_eq!(
            rx.try_recv().unwrap(),
            NotificationEvent::Online { client: "a".into() }
        );
        assert!(rx.try_recv().is_err());
    }
}
