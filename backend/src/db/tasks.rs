use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, instrument};

use crate::db::services::{ping_service, record_service, task_service};
use crate::db::services::record_service::{CompactionSummary, TierWindows};
use crate::server::config::RuntimeSettings;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub compaction: CompactionSummary,
    pub expired_records: u64,
    pub expired_ping_records: u64,
    pub expired_task_results: u64,
}

/// Slow-cadence job that compacts the record store and trims every table to
/// its configured keep-window.
pub struct RecordMaintenance {
    db: DatabaseConnection,
    windows: TierWindows,
    settings: watch::Receiver<RuntimeSettings>,
}

impl RecordMaintenance {
    pub fn new(
        db: DatabaseConnection,
        windows: TierWindows,
        settings: watch::Receiver<RuntimeSettings>,
    ) -> Self {
        Self {
            db,
            windows,
            settings,
        }
    }

    pub async fn run_periodic_tasks(&self, interval_duration: Duration) {
        info!(
            interval = ?interval_duration,
            "Starting record maintenance tasks."
        );
        let mut interval = time::interval(interval_duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Record maintenance failed; retrying next tick.");
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceSummary, DbErr> {
        let (record_hours, ping_hours) = {
            let settings = self.settings.borrow();
            (
                settings.record_preserve_hours,
                settings.ping_record_preserve_hours,
            )
        };

        let compaction = record_service::compact_records(&self.db, now, self.windows).await?;

        let record_cutoff = now - chrono::Duration::hours(record_hours);
        let expired_records = record_service::delete_records_before(&self.db, record_cutoff).await?;
        let expired_task_results = task_service::delete_tasks_before(&self.db, record_cutoff).await?;

        let ping_cutoff = now - chrono::Duration::hours(ping_hours);
        let expired_ping_records =
            ping_service::delete_ping_records_before(&self.db, ping_cutoff).await?;

        let summary = MaintenanceSummary {
            compaction,
            expired_records,
            expired_ping_records,
            expired_task_results,
        };
        info!(?summary, "Record maintenance finished.");
        Ok(summary)
    }
}
