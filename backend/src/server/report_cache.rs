use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Floor applied to a zero CPU reading on the public snapshot.
pub const MIN_PUBLIC_CPU: f64 = 0.01;

/// One telemetry sample as sent by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Report {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub agent_id: String,
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    pub ram_used: i64,
    pub ram_total: i64,
    pub swap_used: i64,
    pub swap_total: i64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub temp: f64,
    pub disk_used: i64,
    pub disk_total: i64,
    pub net_up: i64,
    pub net_down: i64,
    pub net_total_up: i64,
    pub net_total_down: i64,
    pub uptime: i64,
    pub process_count: i64,
    pub tcp_conns: i64,
    pub udp_conns: i64,
    pub updated_at: DateTime<Utc>,
}

/// Latest report per agent.
#[derive(Default)]
pub struct ReportCache {
    reports: RwLock<HashMap<String, Report>>,
}

impl ReportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cached report. The token never reaches the cache.
    pub async fn set(&self, agent_id: &str, mut report: Report) {
        report.token.clear();
        report.agent_id = agent_id.to_owned();
        self.reports.write().await.insert(agent_id.to_owned(), report);
    }

    pub async fn get(&self, agent_id: &str) -> Option<Report> {
        self.reports.read().await.get(agent_id).cloned()
    }

    pub async fn remove(&self, agent_id: &str) {
        self.reports.write().await.remove(agent_id);
    }

    /// Copy of every report (agent id kept), for internal consumers.
    pub async fn snapshot(&self) -> HashMap<String, Report> {
        self.reports.read().await.clone()
    }

    /// Copy fit for the public surface: hidden agents dropped, agent ids
    /// blanked inside each report, zero CPU raised to a visible floor.
    pub async fn snapshot_filtered(&self, hidden: &HashSet<String>) -> HashMap<String, Report> {
        self.reports
            .read()
            .await
            .iter()
            .filter(|(id, _)| !hidden.contains(*id))
            .map(|(id, report)| {
                let mut public = report.clone();
                public.agent_id.clear();
                public.token.clear();
                if public.cpu_usage == 0.0 {
                    public.cpu_usage = MIN_PUBLIC_CPU;
                }
                (id.clone(), public)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cached_reports_never_hold_tokens() {
        let cache = ReportCache::new();
        let report = Report {
            token: "secret".into(),
            cpu_usage: 12.5,
            ..Default::default()
        };
        cache.set("u1", report).await;

        let stored = cache.get("u1").await.unwrap();
        assert!(stored.token.is_empty());
        assert_eq!(stored.agent_id, "u1");
        assert!(!serde_json::to_string(&stored).unwrap().contains("token"));
    }

    #[tokio::test]
    async fn public_snapshot_hides_and_blanks() {
        let cache = ReportCache::new();
        cache.set("u1", Report::default()).await;
        cache
            .set(
                "u2",
                Report {
                    cpu_usage: 50.0,
                    ..Default::default()
                },
            )
            .await;

        let hidden: HashSet<String> = ["u2".to_string()].into();
        let snapshot = cache.snapshot_filtered(&hidden).await;
        assert_eq!(snapshot.len(), 1);
        let public = &snapshot["u1"];
        assert!(public.agent_id.is_empty());
        assert_eq!(public.cpu_usage, MIN_PUBLIC_CPU);

        // The cache itself is untouched.
        assert_eq!(cache.get("u1").await.unwrap().cpu_usage, 0.0);
        assert_eq!(cache.get("u1").await.unwrap().agent_id, "u1");
    }
}
