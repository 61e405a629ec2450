use std::sync::Arc;
use std::time::Duration;

use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::entities::{client_list, ping_task};
use crate::db::services::ping_service;
use crate::server::agent_state::ConnectedAgents;
use crate::server::timer_groups::{group_by_interval, GroupedTimers};

#[derive(Debug, Serialize, PartialEq)]
pub struct PingCommand<'a> {
    pub message: &'static str,
    pub ping_task_id: i32,
    pub ping_type: &'a str,
    pub ping_target: &'a str,
}

impl<'a> PingCommand<'a> {
    pub fn for_task(task: &'a ping_task::Model) -> Self {
        Self {
            message: "ping",
            ping_task_id: task.id,
            ping_type: &task.ping_type,
            ping_target: &task.target,
        }
    }
}

/// Dispatches probe commands on one timer per distinct task interval.
pub struct PingScheduler {
    agents: Arc<ConnectedAgents>,
    timers: GroupedTimers,
}

impl PingScheduler {
    pub fn new(agents: Arc<ConnectedAgents>) -> Self {
        Self {
            agents,
            timers: GroupedTimers::new("ping", Duration::from_secs(1)),
        }
    }

    pub async fn reload(&self, tasks: Vec<ping_task::Model>) {
        let groups = group_by_interval(tasks, |t| i64::from(t.interval));
        let agents = self.agents.clone();
        self.timers
            .reload(groups, move |tasks| {
                let agents = agents.clone();
                async move {
                    dispatch_group(&agents, &tasks).await;
                }
            })
            .await;
    }

    pub async fn reload_from_db(&self, db: &DatabaseConnection) -> Result<(), DbErr> {
        let tasks = ping_service::list_ping_tasks(db).await?;
        self.reload(tasks).await;
        Ok(())
    }

    pub async fn active_intervals(&self) -> Vec<u64> {
        self.timers.active_intervals().await
    }
}

/// Sends each task's probe to every targeted agent that is online. Returns
/// the number of frames written.
pub async fn dispatch_group(agents: &ConnectedAgents, tasks: &[ping_task::Model]) -> usize {
    let mut sent = 0;
    for task in tasks {
        let command = PingCommand::for_task(task);
        for client in client_list(&task.clients) {
            let Some(session) = agents.get(&client) else {
                continue;
            };
            if !session.accepts_push() {
                continue;
            }
            match session.send_json(&command).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(client = %client, task_id = task.id, error = %e, "Failed to send ping command.");
                }
            }
        }
    }
    debug!(tasks = tasks.len(), frames = sent, "Ping commands dispatched.");
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::client_list_json;
    use crate::server::agent_state::channel_session;
    use axum::extract::ws::Message;
    use futures::StreamExt;

    fn task(id: i32, clients: &[&str], interval: i32) -> ping_task::Model {
        let clients: Vec<String> = clients.iter().map(|c| c.to_string()).collect();
        ping_task::Model {
            id,
            name: format!("task-{id}"),
            clients: client_list_json(&clients),
            ping_type: "icmp".into(),
            target: "1.1.1.1".into(),
            interval,
        }
    }

    #[tokio::test]
    async fn offline_agents_are_skipped() {
        let agents = ConnectedAgents::new();
        let (session, mut rx) = channel_session("u1");
        agents.register(session).unwrap();

        let sent = dispatch_group(&agents, &[task(7, &["u1", "u2"], 10)]).await;
        assert_eq!(sent, 1);

        let Some(Message::Text(text)) = rx.next().await else {
            panic!("expected a ping frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["message"], "ping");
        assert_eq!(value["ping_task_id"], 7);
        assert_eq!(value["ping_type"], "icmp");
        assert_eq!(value["ping_target"], "1.1.1.1");
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_sharing_an_interval_share_a_timer() {
        let agents = ConnectedAgents::new();
        let scheduler = PingScheduler::new(agents);

        scheduler
            .reload(vec![task(1, &["u1"], 10), task(2, &["u2"], 10)])
            .await;
        assert_eq!(scheduler.active_intervals().await, vec![10]);

        scheduler
            .reload(vec![task(1, &["u1"], 10), task(2, &["u2"], 20)])
            .await;
        assert_eq!(scheduler.active_intervals().await, vec![10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_rate_follows_interval() {
        let agents = ConnectedAgents::new();
        let (session, mut rx) = channel_session("u1");
        agents.register(session).unwrap();
        let scheduler = PingScheduler::new(agents);
        scheduler.reload(vec![task(1, &["u1"], 10)]).await;

        tokio::time::sleep(Duration::from_secs(95)).await;
        let mut frames = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(1), rx.next()).await {
            frames += 1;
        }
        assert!((8..=10).contains(&frames), "got {frames} frames");
    }
}
