use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::db::entities::offline_notification;
use crate::db::services::alert_service::{self, DEFAULT_GRACE_PERIOD_SECS};
use crate::notifications::models::NotificationEvent;
use crate::notifications::service::EventSink;
use crate::server::config::RuntimeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineRule {
    pub enabled: bool,
    pub grace: Duration,
}

impl From<&offline_notification::Model> for OfflineRule {
    fn from(model: &offline_notification::Model) -> Self {
        let secs = if model.grace_period > 0 {
            model.grace_period
        } else {
            DEFAULT_GRACE_PERIOD_SECS
        };
        Self {
            enabled: model.enable,
            grace: Duration::from_secs(secs as u64),
        }
    }
}

#[derive(Debug, Default)]
struct PresenceState {
    /// False until the first ever session opens.
    seen: bool,
    conn_exists: bool,
    connection_id: u64,
    pending_since: Option<DateTime<Utc>>,
    pending_cid: Option<u64>,
    offline_notified: bool,
}

/// Debounces presence transitions into offline/online notifications.
///
/// An offline only fires once its grace period elapses with the same
/// connection id still current and no session open. The very first session
/// of an agent never produces an online notification.
pub struct OfflineMonitor {
    states: Mutex<HashMap<String, PresenceState>>,
    rules: RwLock<HashMap<String, OfflineRule>>,
    events: EventSink,
    settings: watch::Receiver<RuntimeSettings>,
    db: Option<DatabaseConnection>,
}

impl OfflineMonitor {
    pub fn new(
        events: EventSink,
        settings: watch::Receiver<RuntimeSettings>,
        db: Option<DatabaseConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
            events,
            settings,
            db,
        })
    }

    pub async fn set_rules(&self, rules: &[offline_notification::Model]) {
        let table: HashMap<String, OfflineRule> = rules
            .iter()
            .map(|r| (r.client.clone(), OfflineRule::from(r)))
            .collect();
        info!(rules = table.len(), "Offline rules loaded.");
        *self.rules.write().await = table;
    }

    pub async fn reload_rules(&self, db: &DatabaseConnection) -> Result<(), DbErr> {
        let rules = alert_service::list_offline_rules(db).await?;
        self.set_rules(&rules).await;
        Ok(())
    }

    pub async fn forget(&self, agent_id: &str) {
        self.states.lock().await.remove(agent_id);
        self.rules.write().await.remove(agent_id);
    }

    fn notifications_enabled(&self) -> bool {
        self.settings.borrow().notification_enabled
    }

    pub async fn on_online(&self, agent_id: &str, connection_id: u64) {
        let mut states = self.states.lock().await;
        let state = states.entry(agent_id.to_owned()).or_default();
        state.conn_exists = true;
        state.connection_id = connection_id;

        if !state.seen {
            state.seen = true;
            debug!(client = %agent_id, connection_id, "First connection; online notification suppressed.");
            return;
        }

        if state.offline_notified {
            state.offline_notified = false;
            if self.notifications_enabled() {
                self.events.emit(NotificationEvent::Online {
                    client: agent_id.to_owned(),
                });
            }
        }
    }

    pub async fn on_offline(self: &Arc<Self>, agent_id: &str, connection_id: u64) {
        {
            let mut states = self.states.lock().await;
            let state = states.entry(agent_id.to_owned()).or_default();
            if state.seen && state.connection_id != connection_id {
                debug!(client = %agent_id, connection_id, current = state.connection_id, "Stale offline ignored.");
                return;
            }
            state.seen = true;
            state.conn_exists = false;
            state.connection_id = connection_id;
            state.pending_since = Some(Utc::now());
            state.pending_cid = Some(connection_id);
        }

        let rule = self.rules.read().await.get(agent_id).copied();
        let Some(rule) = rule.filter(|r| r.enabled) else {
            return;
        };

        let monitor = Arc::clone(self);
        let agent_id = agent_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(rule.grace).await;
            monitor.grace_elapsed(&agent_id, connection_id).await;
        });
    }

    async fn grace_elapsed(&self, agent_id: &str, connection_id: u64) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(agent_id) else {
            return;
        };
        if state.pending_cid != Some(connection_id) {
            return;
        }
        state.pending_cid = None;
        let since = state.pending_since.take();
        if state.conn_exists || state.connection_id != connection_id {
            return;
        }
        if !self.notifications_enabled() {
            return;
        }

        state.offline_notified = true;
        drop(states);

        info!(client = %agent_id, connection_id, since = ?since, "Client went offline.");
        self.events.emit(NotificationEvent::Offline {
            client: agent_id.to_owned(),
        });

        if let Some(db) = self.db.clone() {
            let agent_id = agent_id.to_owned();
            tokio::spawn(async move {
                if let Err(e) = alert_service::mark_offline_notified(&db, &agent_id, Utc::now()).await {
                    warn!(client = %agent_id, error = %e, "Failed to stamp offline rule.");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::service::event_channel;
    use tokio::sync::mpsc;

    const GRACE: i32 = 60;

    fn setup(enabled: bool) -> (Arc<OfflineMonitor>, mpsc::Receiver<NotificationEvent>) {
        let (sink, rx) = event_channel(16);
        let (_tx, settings) = watch::channel(RuntimeSettings {
            notification_enabled: enabled,
            ..Default::default()
        });
        (OfflineMonitor::new(sink, settings, None), rx)
    }

    fn rule(client: &str) -> offline_notification::Model {
        offline_notification::Model {
            client: client.into(),
            enable: true,
            grace_period: GRACE,
            last_notified: None,
        }
    }

    async fn wait(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    fn drain(rx: &mut mpsc::Receiver<NotificationEvent>) -> Vec<NotificationEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn offline(c: &str) -> NotificationEvent {
        NotificationEvent::Offline { client: c.into() }
    }

    fn online(c: &str) -> NotificationEvent {
        NotificationEvent::Online { client: c.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn first_connection_is_silent_then_offline_fires() {
        let (monitor, mut rx) = setup(true);
        monitor.set_rules(&[rule("u1")]).await;

        monitor.on_online("u1", 1).await;
        assert!(drain(&mut rx).is_empty());

        monitor.on_offline("u1", 1).await;
        wait(GRACE as u64 - 1).await;
        assert!(drain(&mut rx).is_empty());
        wait(2).await;
        assert_eq!(drain(&mut rx), vec![offline("u1")]);

        monitor.on_online("u1", 2).await;
        assert_eq!(drain(&mut rx), vec![online("u1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_is_silent() {
        let (monitor, mut rx) = setup(true);
        monitor.set_rules(&[rule("u1")]).await;

        monitor.on_online("u1", 1).await;
        monitor.on_offline("u1", 1).await;
        wait(10).await;
        monitor.on_online("u1", 2).await;
        wait(GRACE as u64 * 2).await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flap_then_disconnect_fires_once_at_the_end() {
        let (monitor, mut rx) = setup(true);
        monitor.set_rules(&[rule("u1")]).await;

        monitor.on_online("u1", 1).await;
        monitor.on_offline("u1", 1).await;
        wait(10).await;
        monitor.on_online("u1", 2).await;
        wait(10).await;
        monitor.on_offline("u1", 2).await;

        // First timer fires at t=60 against a superseded connection.
        wait(45).await;
        assert!(drain(&mut rx).is_empty());

        // Second timer fires at t=80.
        wait(20).await;
        assert_eq!(drain(&mut rx), vec![offline("u1")]);
        wait(GRACE as u64).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_offline_from_old_session_is_ignored() {
        let (monitor, mut rx) = setup(true);
        monitor.set_rules(&[rule("u1")]).await;

        monitor.on_online("u1", 1).await;
        monitor.on_online("u1", 2).await;
        monitor.on_offline("u1", 1).await;
        wait(GRACE as u64 + 1).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_rule_or_global_switch_suppresses_events() {
        let (monitor, mut rx) = setup(true);
        monitor
            .set_rules(&[offline_notification::Model {
                enable: false,
                ..rule("u1")
            }])
            .await;
        monitor.on_online("u1", 1).await;
        monitor.on_offline("u1", 1).await;
        wait(GRACE as u64 + 1).await;
        assert!(drain(&mut rx).is_empty());

        let (monitor, mut rx) = setup(false);
        monitor.set_rules(&[rule("u1")]).await;
        monitor.on_online("u1", 1).await;
        monitor.on_offline("u1", 1).await;
        wait(GRACE as u64 + 1).await;
        monitor.on_online("u1", 2).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_rule_never_notifies() {
        let (monitor, mut rx) = setup(true);
        monitor.on_online("u9", 1).await;
        monitor.on_offline("u9", 1).await;
        wait(DEFAULT_GRACE_PERIOD_SECS as u64 + 1).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn rule_conversion_defaults_grace() {
        let model = offline_notification::Model {
            grace_period: 0,
            ..rule("u1")
        };
        assert_eq!(
            OfflineRule::from(&model).grace,
            Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS as u64)
        );
    }
}
