use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::alerting::offline_monitor::OfflineMonitor;
use crate::db::services::{ping_service, task_service};
use crate::server::agent_state::{AgentSender, AgentSession, ConnectedAgents, RegistryError};
use crate::server::metric_buffer::MinuteBuffer;
use crate::server::report_cache::{Report, ReportCache};

/// Probe outcome pushed by an agent. A negative value means loss.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PingResult {
    pub task_id: i32,
    pub value: i32,
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default)]
    pub result: String,
    pub exit_code: i32,
    #[serde(default = "Utc::now")]
    pub finished_at: DateTime<Utc>,
}

/// One inbound text frame on an agent session.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    Report(Box<Report>),
    PingResult(PingResult),
    TaskResult(TaskResult),
    Heartbeat,
    TerminalJoin { request_id: String },
}

/// A `type` tag names the frame outright. Untagged frames are classified by
/// shape: `task_id` with `exit_code` is an exec result, `task_id` with
/// `value` a ping result, anything else a report.
pub fn decode_frame(text: &str) -> Result<AgentFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind.as_deref() {
        Some("ping_result") => Ok(AgentFrame::PingResult(serde_json::from_value(value)?)),
        Some("task_result") => Ok(AgentFrame::TaskResult(serde_json::from_value(value)?)),
        Some("heartbeat") => Ok(AgentFrame::Heartbeat),
        Some("terminal_join") => {
            #[derive(Deserialize)]
            struct Join {
                request_id: String,
            }
            let join: Join = serde_json::from_value(value)?;
            Ok(AgentFrame::TerminalJoin {
                request_id: join.request_id,
            })
        }
        _ if value.get("task_id").is_some() && value.get("exit_code").is_some() => {
            Ok(AgentFrame::TaskResult(serde_json::from_value(value)?))
        }
        _ if value.get("task_id").is_some() && value.get("value").is_some() => {
            Ok(AgentFrame::PingResult(serde_json::from_value(value)?))
        }
        _ => Ok(AgentFrame::Report(Box::new(serde_json::from_value(value)?))),
    }
}

/// The report's own timestamp when the agent sent one, else receive time.
pub fn sample_time(report: &Report, received_at: DateTime<Utc>) -> DateTime<Utc> {
    if report.updated_at.timestamp() > 0 {
        report.updated_at
    } else {
        received_at
    }
}

/// Shared state every agent session needs, whatever its transport.
#[derive(Clone)]
pub struct AgentStreamContext {
    pub db: DatabaseConnection,
    pub agents: Arc<ConnectedAgents>,
    pub reports: Arc<ReportCache>,
    pub buffer: Arc<MinuteBuffer>,
    pub presence: Arc<OfflineMonitor>,
}

impl AgentStreamContext {
    /// Registers a fresh session and reports it online. Fails without any
    /// presence transition when the agent already has a session.
    pub async fn open_session(
        &self,
        agent_id: &str,
        connection_id: u64,
        sender: AgentSender,
    ) -> Result<Arc<AgentSession>, RegistryError> {
        let session = AgentSession::new(agent_id, connection_id, sender);
        self.agents.register(session.clone())?;
        info!(client = %agent_id, connection_id, "Agent session registered.");
        self.presence.on_online(agent_id, connection_id).await;
        Ok(session)
    }

    /// Deregisters (only if still current), reports offline and closes the
    /// socket once.
    pub async fn close_session(&self, session: &Arc<AgentSession>) {
        let removed = self.agents.deregister(&session.agent_id, session);
        self.presence
            .on_offline(&session.agent_id, session.connection_id)
            .await;
        session.close().await;
        info!(
            client = %session.agent_id,
            connection_id = session.connection_id,
            removed,
            "Agent session closed."
        );
    }

    pub async fn ingest_report(&self, agent_id: &str, report: Report) {
        let sampled_at = sample_time(&report, Utc::now());
        self.reports.set(agent_id, report.clone()).await;
        self.buffer.append(agent_id, sampled_at, report);
    }

    pub async fn handle_frame(&self, session: &AgentSession, frame: AgentFrame) {
        session.touch();
        let agent_id = session.agent_id.as_str();
        match frame {
            AgentFrame::Report(report) => self.ingest_report(agent_id, *report).await,
            AgentFrame::PingResult(ping) => {
                if let Err(e) =
                    ping_service::insert_ping_record(&self.db, agent_id, ping.task_id, ping.time, ping.value)
                        .await
                {
                    error!(client = %agent_id, task_id = ping.task_id, error = %e, "Failed to store ping result.");
                }
            }
            AgentFrame::TaskResult(result) => {
                match task_service::save_task_result(
                    &self.db,
                    &result.task_id,
                    agent_id,
                    result.result,
                    result.exit_code,
                    result.finished_at,
                )
                .await
                {
                    Ok(true) => debug!(client = %agent_id, task_id = %result.task_id, "Task result stored."),
                    Ok(false) => warn!(client = %agent_id, task_id = %result.task_id, "Result for unknown task ignored."),
                    Err(e) => error!(client = %agent_id, task_id = %result.task_id, error = %e, "Failed to store task result."),
                }
            }
            AgentFrame::Heartbeat => {}
            AgentFrame::TerminalJoin { request_id } => {
                debug!(client = %agent_id, request_id = %request_id, "Agent acknowledged terminal request.");
            }
        }
    }
}

/// Reads frames until the socket ends or a write on the session fails, then
/// tears the session down.
pub async fn process_agent_stream<S>(
    mut stream: S,
    session: Arc<AgentSession>,
    context: Arc<AgentStreamContext>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = session.closing() => {
                debug!(client = %session.agent_id, failed = session.is_failed(), "Agent session ended from the write side.");
                break;
            }
        };
        let Some(next) = next else {
            break;
        };
        match next {
            Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                Ok(frame) => context.handle_frame(&session, frame).await,
                Err(e) => {
                    warn!(client = %session.agent_id, error = %e, "Malformed agent frame ignored.");
                }
            },
            Ok(Message::Close(_)) => {
                debug!(client = %session.agent_id, "Agent closed the socket.");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(client = %session.agent_id, error = %e, "Agent socket error.");
                break;
            }
        }
        if session.is_closed() {
            break;
        }
    }
    context.close_session(&session).await;
}
