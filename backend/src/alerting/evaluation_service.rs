use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::db::entities::{client, client_list, load_notification, record};
use crate::db::services::{alert_service, client_service, record_service};
use crate::notifications::models::NotificationEvent;
use crate::notifications::service::EventSink;
use crate::server::config::RuntimeSettings;
use crate::server::timer_groups::{group_by_interval, GroupedTimers};

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),
    #[error("Unsupported metric: {0}")]
    UnsupportedMetric(String),
}

fn percent(used: i64, static_total: i64, record_total: i64) -> f64 {
    let total = if static_total > 0 { static_total } else { record_total };
    if total <= 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Value of `metric` for one minute record. Ratio metrics are measured
/// against the client's static totals, falling back to the row's own totals
/// for clients that never uploaded basic info.
pub fn metric_value(metric: &str, row: &record::Model, host: &client::Model) -> Option<f64> {
    let value = match metric {
        "ram" => percent(row.ram, host.mem_total, row.ram_total),
        "swap" => percent(row.swap, host.swap_total, row.swap_total),
        "disk" => percent(row.disk, host.disk_total, row.disk_total),
        "cpu" => row.cpu,
        "gpu" => row.gpu,
        "load" => row.load,
        "temp" => row.temp,
        "process" => row.process as f64,
        "connections" => row.connections as f64,
        "connections_udp" => row.connections_udp as f64,
        _ => return None,
    };
    Some(value)
}

/// True when at least `ceil(N * ratio)` of the `N` samples reach the
/// threshold. No samples never breach.
pub fn is_breaching(values: &[f64], threshold: f64, ratio: f64) -> bool {
    if values.is_empty() {
        return false;
    }
    let required = (values.len() as f64 * ratio).ceil() as usize;
    let hits = values.iter().filter(|v| **v >= threshold).count();
    hits >= required.max(1)
}

pub fn in_cooldown(rule: &load_notification::Model, now: DateTime<Utc>) -> bool {
    rule.last_notified
        .is_some_and(|at| now - at < chrono::Duration::minutes(i64::from(rule.interval)))
}

/// Evaluates load rules against the short-term record table.
pub struct LoadEvaluator {
    db: DatabaseConnection,
    events: EventSink,
    settings: watch::Receiver<RuntimeSettings>,
}

impl LoadEvaluator {
    pub fn new(
        db: DatabaseConnection,
        events: EventSink,
        settings: watch::Receiver<RuntimeSettings>,
    ) -> Self {
        Self { db, events, settings }
    }

    /// Runs one rule. Returns the breaching clients; a non-empty result means
    /// an event was emitted and the cool-down stamp moved.
    pub async fn evaluate_rule(
        &self,
        rule: &load_notification::Model,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, EvaluationError> {
        if !alert_service::LOAD_METRICS.contains(&rule.metric.as_str()) {
            return Err(EvaluationError::UnsupportedMetric(rule.metric.clone()));
        }
        if in_cooldown(rule, now) {
            debug!(rule_id = rule.id, "Load rule in cool-down; skipped.");
            return Ok(Vec::new());
        }

        let window_start = now - chrono::Duration::minutes(i64::from(rule.interval));
        let mut breaching = Vec::new();
        for uuid in client_list(&rule.clients) {
            let Some(host) = client_service::get_client_by_uuid(&self.db, &uuid).await? else {
                continue;
            };
            let rows = record_service::get_recent_records(&self.db, &uuid, window_start, now).await?;
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|row| metric_value(&rule.metric, row, &host))
                .collect();
            if is_breaching(&values, rule.threshold, rule.ratio) {
                breaching.push(uuid);
            }
        }

        if breaching.is_empty() {
            return Ok(breaching);
        }

        info!(rule_id = rule.id, rule = %rule.name, clients = ?breaching, "Load rule triggered.");
        self.events.emit(NotificationEvent::LoadAlert {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            metric: rule.metric.clone(),
            threshold: rule.threshold,
            ratio: rule.ratio,
            interval_minutes: rule.interval,
            clients: breaching.clone(),
        });
        alert_service::mark_load_rule_notified(&self.db, rule.id, now).await?;
        Ok(breaching)
    }

    /// Evaluates one timer group. Rules are re-read so the cool-down stamp is
    /// current; deleted rules drop out silently.
    pub async fn run_evaluation_cycle(&self, rule_ids: &[i32], now: DateTime<Utc>) {
        if !self.settings.borrow().notification_enabled {
            return;
        }
        for id in rule_ids {
            let rule = match alert_service::get_load_rule(&self.db, *id).await {
                Ok(Some(rule)) => rule,
                Ok(None) => continue,
                Err(e) => {
                    error!(rule_id = id, error = %e, "Failed to load rule.");
                    continue;
                }
            };
            if let Err(e) = self.evaluate_rule(&rule, now).await {
                error!(rule_id = id, error = %e, "Load rule evaluation failed.");
            }
        }
    }
}

/// One timer per distinct rule interval, in minutes.
pub struct LoadRuleScheduler {
    evaluator: Arc<LoadEvaluator>,
    timers: GroupedTimers,
}

impl LoadRuleScheduler {
    pub fn new(evaluator: Arc<LoadEvaluator>) -> Self {
        Self {
            evaluator,
            timers: GroupedTimers::new("load", Duration::from_secs(60)),
        }
    }

    pub async fn reload(&self, rules: Vec<load_notification::Model>) {
        let pairs: Vec<(i32, i32)> = rules.into_iter().map(|r| (r.interval, r.id)).collect();
        let groups: BTreeMap<u64, Vec<i32>> = group_by_interval(pairs, |(interval, _)| i64::from(*interval))
            .into_iter()
            .map(|(interval, rules)| (interval, rules.into_iter().map(|(_, id)| id).collect()))
            .collect();
        let evaluator = self.evaluator.clone();
        self.timers
            .reload(groups, move |ids: Arc<Vec<i32>>| {
                let evaluator = evaluator.clone();
                async move {
                    evaluator.run_evaluation_cycle(&ids, Utc::now()).await;
                }
            })
            .await;
    }

    pub async fn reload_from_db(&self, db: &DatabaseConnection) -> Result<(), DbErr> {
        let rules = alert_service::list_load_rules(db).await?;
        self.reload(rules).await;
        Ok(())
    }

    pub async fn active_intervals(&self) -> Vec<u64> {
        self.timers.active_intervals().await
    }
}
