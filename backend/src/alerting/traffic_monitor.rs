use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::{watch, Mutex};
use tokio::time;
use tracing::{error, info};

use crate::db::services::client_service;
use crate::notifications::models::NotificationEvent;
use crate::notifications::service::EventSink;
use crate::server::config::RuntimeSettings;
use crate::server::report_cache::{Report, ReportCache};

pub const TRAFFIC_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Bytes counted against the limit for a given `traffic_limit_type`.
pub fn traffic_used(limit_type: &str, report: &Report) -> Option<i64> {
    let up = report.net_total_up;
    let down = report.net_total_down;
    match limit_type {
        "sum" => Some(up.saturating_add(down)),
        "max" => Some(up.max(down)),
        "min" => Some(up.min(down)),
        "up" => Some(up),
        "down" => Some(down),
        _ => None,
    }
}

/// Fires a traffic alert once per upward crossing of the configured share of
/// each client's limit.
pub struct TrafficMonitor {
    db: DatabaseConnection,
    reports: Arc<ReportCache>,
    events: EventSink,
    settings: watch::Receiver<RuntimeSettings>,
    alerted: Mutex<HashSet<String>>,
}

impl TrafficMonitor {
    pub fn new(
        db: DatabaseConnection,
        reports: Arc<ReportCache>,
        events: EventSink,
        settings: watch::Receiver<RuntimeSettings>,
    ) -> Self {
        Self {
            db,
            reports,
            events,
            settings,
            alerted: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(TRAFFIC_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.check().await {
                error!(error = %e, "Traffic check failed.");
            }
        }
    }

    /// Returns the clients that crossed their threshold on this pass.
    pub async fn check(&self) -> Result<Vec<String>, DbErr> {
        let percentage = self.settings.borrow().traffic_limit_percentage;
        let clients = client_service::list_clients(&self.db).await?;
        let reports = self.reports.snapshot().await;
        let mut alerted = self.alerted.lock().await;
        let mut crossed = Vec::new();

        for client in clients {
            if client.traffic_limit <= 0 {
                alerted.remove(&client.uuid);
                continue;
            }
            let Some(report) = reports.get(&client.uuid) else {
                continue;
            };
            let Some(used) = traffic_used(&client.traffic_limit_type, report) else {
                continue;
            };
            let threshold = client.traffic_limit as f64 * percentage / 100.0;
            if (used as f64) < threshold {
                alerted.remove(&client.uuid);
                continue;
            }
            if !alerted.insert(client.uuid.clone()) {
                continue;
            }
            info!(client = %client.uuid, used, limit = client.traffic_limit, "Traffic threshold crossed.");
            self.events.emit(NotificationEvent::TrafficLimit {
                client: client.uuid.clone(),
                used,
                limit: client.traffic_limit,
                limit_type: client.traffic_limit_type.clone(),
            });
            crossed.push(client.uuid);
        }
        Ok(crossed)
    }
}
