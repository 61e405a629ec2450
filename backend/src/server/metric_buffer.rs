use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sea_orm::{DatabaseConnection, DbErr};
use tokio::time;
use tracing::{debug, error, info};

use crate::db::entities::record;
use crate::db::services::record_service::{self, truncate_time};
use crate::server::report_cache::Report;

/// Samples older than this are dropped before each flush.
pub const BUFFER_WINDOW_SECS: i64 = 60;

/// Per-agent raw reports of the current minute.
#[derive(Default)]
pub struct MinuteBuffer {
    buffer: DashMap<String, Vec<(DateTime<Utc>, Report)>>,
}

impl MinuteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, agent_id: &str, received_at: DateTime<Utc>, report: Report) {
        self.buffer
            .entry(agent_id.to_owned())
            .or_default()
            .push((received_at, report));
    }

    pub fn remove(&self, agent_id: &str) {
        self.buffer.remove(agent_id);
    }

    pub fn len_for(&self, agent_id: &str) -> usize {
        self.buffer.get(agent_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Drops samples older than the window, then averages what is left per
    /// agent. Buffers are kept so late frames still count next minute.
    pub fn prune_and_average(&self, now: DateTime<Utc>, stamp: DateTime<Utc>) -> Vec<record::Model> {
        let horizon = now - Duration::seconds(BUFFER_WINDOW_SECS);
        let mut averaged = Vec::new();
        for mut entry in self.buffer.iter_mut() {
            let (agent_id, samples) = entry.pair_mut();
            samples.retain(|(at, _)| *at >= horizon);
            if samples.is_empty() {
                continue;
            }
            let reports: Vec<&Report> = samples.iter().map(|(_, r)| r).collect();
            averaged.push(average_reports(agent_id, stamp, &reports));
        }
        self.buffer.retain(|_, samples| !samples.is_empty());
        averaged
    }
}

/// Arithmetic mean of every numeric field; integer fields use integer
/// division.
pub fn average_reports(client: &str, time: DateTime<Utc>, reports: &[&Report]) -> record::Model {
    let n = reports.len().max(1);
    let fmean = |f: fn(&Report) -> f64| reports.iter().map(|r| f(*r)).sum::<f64>() / n as f64;
    let imean = |f: fn(&Report) -> i64| {
        (reports.iter().map(|r| i128::from(f(*r))).sum::<i128>() / n as i128) as i64
    };

    record::Model {
        client: client.to_owned(),
        time,
        cpu: fmean(|r| r.cpu_usage),
        gpu: fmean(|r| r.gpu_usage),
        load: fmean(|r| r.load1),
        temp: fmean(|r| r.temp),
        ram: imean(|r| r.ram_used),
        ram_total: imean(|r| r.ram_total),
        swap: imean(|r| r.swap_used),
        swap_total: imean(|r| r.swap_total),
        disk: imean(|r| r.disk_used),
        disk_total: imean(|r| r.disk_total),
        net_in: imean(|r| r.net_down),
        net_out: imean(|r| r.net_up),
        net_total_up: imean(|r| r.net_total_up),
        net_total_down: imean(|r| r.net_total_down),
        process: imean(|r| r.process_count),
        connections: imean(|r| r.tcp_conns),
        connections_udp: imean(|r| r.udp_conns),
    }
}

/// Writes one averaged record per agent every wall-clock minute.
pub struct MinuteAggregator {
    buffer: Arc<MinuteBuffer>,
    db: DatabaseConnection,
}

impl MinuteAggregator {
    pub fn new(buffer: Arc<MinuteBuffer>, db: DatabaseConnection) -> Self {
        Self { buffer, db }
    }

    pub async fn run(&self) {
        info!("Minute aggregator started.");
        loop {
            let now = Utc::now();
            let next = truncate_time(now, Duration::minutes(1)) + Duration::minutes(1);
            let wait = (next - now).to_std().unwrap_or_default();
            time::sleep(wait).await;

            if let Err(e) = self.flush(Utc::now()).await {
                error!(error = %e, "Failed to persist minute records.");
            }
        }
    }

    pub async fn flush(&self, now: DateTime<Utc>) -> Result<usize, DbErr> {
        let stamp = truncate_time(now, Duration::minutes(1));
        let records = self.buffer.prune_and_average(now, stamp);
        let written = records.len();
        for record in records {
            record_service::insert_record(&self.db, record).await?;
        }
        debug!(records = written, minute = %stamp, "Minute records written.");
        Ok(written)
    }
}
