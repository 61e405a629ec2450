use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::{distr::Alphanumeric, Rng};
use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::services::task_service;
use crate::server::agent_state::ConnectedAgents;

const TASK_ID_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("Client {0} is offline")]
    AgentOffline(String),
    #[error("No clients selected")]
    NoClients,
    #[error("Command is empty")]
    EmptyCommand,
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),
}

#[derive(Debug, Serialize, PartialEq)]
struct ExecCommand<'a> {
    message: &'static str,
    task_id: &'a str,
    command: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchedTask {
    pub task_id: String,
    pub clients: Vec<String>,
}

pub fn generate_task_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TASK_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Fans a one-shot command out to a set of online agents.
#[derive(Clone)]
pub struct CommandDispatcher {
    agents: Arc<ConnectedAgents>,
    db: DatabaseConnection,
}

impl CommandDispatcher {
    pub fn new(agents: Arc<ConnectedAgents>, db: DatabaseConnection) -> Self {
        Self { agents, db }
    }

    /// Every requested agent must be online, otherwise nothing is persisted
    /// or sent. Result rows exist before the first frame goes out. Repeated
    /// client ids collapse to their first occurrence.
    pub async fn dispatch(
        &self,
        command: &str,
        clients: &[String],
    ) -> Result<DispatchedTask, DispatcherError> {
        if command.trim().is_empty() {
            return Err(DispatcherError::EmptyCommand);
        }
        let mut seen = HashSet::with_capacity(clients.len());
        let clients: Vec<String> = clients
            .iter()
            .filter(|c| seen.insert(c.as_str()))
            .cloned()
            .collect();
        if clients.is_empty() {
            return Err(DispatcherError::NoClients);
        }

        let mut sessions = Vec::with_capacity(clients.len());
        for client in &clients {
            match self.agents.get(client) {
                Some(session) if session.accepts_push() => sessions.push(session),
                _ => return Err(DispatcherError::AgentOffline(client.clone())),
            }
        }

        let task_id = generate_task_id();
        task_service::create_task(&self.db, &task_id, command, &clients, Utc::now()).await?;

        let frame = ExecCommand {
            message: "exec",
            task_id: &task_id,
            command,
        };
        for session in sessions {
            if let Err(e) = session.send_json(&frame).await {
                warn!(client = %session.agent_id, task_id = %task_id, error = %e, "Failed to send exec command.");
            }
        }
        info!(task_id = %task_id, clients = clients.len(), "Exec task dispatched.");

        Ok(DispatchedTask {
            task_id,
            clients,
        })
    }
}
