use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

use crate::db::services::renewal_service;
use crate::notifications::models::NotificationEvent;
use crate::notifications::service::EventSink;
use crate::server::config::RuntimeSettings;

pub const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub renewed: usize,
    pub expiring: usize,
}

/// Applies auto-renewals and announces upcoming expiries.
pub struct ExpiryWatcher {
    db: DatabaseConnection,
    events: EventSink,
    settings: watch::Receiver<RuntimeSettings>,
    lifetime_threshold: chrono::Duration,
}

impl ExpiryWatcher {
    pub fn new(
        db: DatabaseConnection,
        events: EventSink,
        settings: watch::Receiver<RuntimeSettings>,
        lifetime_threshold: chrono::Duration,
    ) -> Self {
        Self {
            db,
            events,
            settings,
            lifetime_threshold,
        }
    }

    /// First tick fires immediately, so the check also runs at boot.
    pub async fn run(&self) {
        let mut interval = time::interval(EXPIRY_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(summary) => info!(renewed = summary.renewed, expiring = summary.expiring, "Expiry check finished."),
                Err(e) => error!(error = %e, "Expiry check failed."),
            }
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ExpirySummary, DbErr> {
        let renewed =
            renewal_service::apply_auto_renewals(&self.db, now, self.lifetime_threshold).await?;
        for (client, next_expiry) in &renewed {
            self.events.emit(NotificationEvent::Renewed {
                client: client.clone(),
                next_expiry: *next_expiry,
            });
        }

        let (enabled, lead_days) = {
            let settings = self.settings.borrow();
            (
                settings.expire_notification_enabled,
                settings.expire_notification_lead_days,
            )
        };
        let mut expiring = 0;
        if enabled {
            let clients = renewal_service::expiring_clients(
                &self.db,
                now,
                chrono::Duration::days(lead_days.max(0)),
                self.lifetime_threshold,
            )
            .await?;
            let clients: Vec<(String, DateTime<Utc>)> = clients
                .into_iter()
                .filter_map(|c| c.expired_at.map(|at| (c.uuid, at)))
                .collect();
            expiring = clients.len();
            if !clients.is_empty() {
                self.events.emit(NotificationEvent::Expire { clients });
            }
        }

        Ok(ExpirySummary {
            renewed: renewed.len(),
            expiring,
        })
    }
}
