use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::server::agent_state::{AgentSink, ConnectedAgents, SessionError};

pub const TERMINAL_JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_ID_LENGTH: usize = 32;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Client offline!")]
    ClientOffline(String),
    #[error("Unknown terminal session: {0}")]
    UnknownSession(String),
    #[error("Terminal session belongs to another client")]
    WrongClient,
    #[error("Failed to reach agent: {0}")]
    Session(#[from] SessionError),
}

/// One side of a terminal bridge.
pub struct TerminalPeer {
    pub rx: BoxStream<'static, Result<Message, axum::Error>>,
    pub tx: AgentSink,
}

impl TerminalPeer {
    pub fn from_socket<S>(socket: S) -> Self
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + 'static,
    {
        let (tx, rx) = socket.split();
        Self {
            rx: rx.boxed(),
            tx: Box::pin(tx),
        }
    }

    async fn say(&mut self, text: &'static str) {
        let _ = self.tx.send(Message::Text(text.into())).await;
    }

    async fn shutdown(&mut self) {
        let _ = self.tx.send(Message::Close(None)).await;
        let _ = self.tx.close().await;
    }
}

#[derive(Serialize)]
struct TerminalCommand<'a> {
    message: &'static str,
    request_id: &'a str,
}

struct TerminalEntry {
    agent_id: String,
    /// Taken when the agent joins.
    waiter: Option<oneshot::Sender<TerminalPeer>>,
}

pub struct TerminalRequest {
    pub id: String,
    joined: oneshot::Receiver<TerminalPeer>,
}

fn generate_session_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Pairs browser terminal sockets with the agent socket that answers the
/// join request.
pub struct TerminalBroker {
    agents: Arc<ConnectedAgents>,
    sessions: Mutex<HashMap<String, TerminalEntry>>,
    join_timeout: Duration,
}

impl TerminalBroker {
    pub fn new(agents: Arc<ConnectedAgents>) -> Self {
        Self::with_timeout(agents, TERMINAL_JOIN_TIMEOUT)
    }

    pub fn with_timeout(agents: Arc<ConnectedAgents>, join_timeout: Duration) -> Self {
        Self {
            agents,
            sessions: Mutex::new(HashMap::new()),
            join_timeout,
        }
    }

    /// Allocates a session and asks the agent to join it.
    pub async fn open(&self, agent_id: &str) -> Result<TerminalRequest, TerminalError> {
        let session = self
            .agents
            .get(agent_id)
            .filter(|s| s.accepts_push())
            .ok_or_else(|| TerminalError::ClientOffline(agent_id.to_owned()))?;

        let id = generate_session_id();
        let (tx, rx) = oneshot::channel();
        self.sessions.lock().await.insert(
            id.clone(),
            TerminalEntry {
                agent_id: agent_id.to_owned(),
                waiter: Some(tx),
            },
        );

        let command = TerminalCommand {
            message: "terminal",
            request_id: &id,
        };
        if let Err(e) = session.send_json(&command).await {
            self.remove(&id).await;
            return Err(e.into());
        }
        info!(client = %agent_id, session_id = %id, "Terminal requested.");
        Ok(TerminalRequest { id, joined: rx })
    }

    /// Hands the agent socket to the waiting browser. The socket is closed
    /// when the session is unknown or owned by a different agent.
    pub async fn attach(
        &self,
        id: &str,
        agent_id: &str,
        mut peer: TerminalPeer,
    ) -> Result<(), TerminalError> {
        let waiter = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(id) {
                Some(entry) if entry.agent_id != agent_id => Err(TerminalError::WrongClient),
                Some(entry) => entry
                    .waiter
                    .take()
                    .ok_or_else(|| TerminalError::UnknownSession(id.to_owned())),
                None => Err(TerminalError::UnknownSession(id.to_owned())),
            }
        };
        let waiter = match waiter {
            Ok(waiter) => waiter,
            Err(e) => {
                peer.shutdown().await;
                return Err(e);
            }
        };
        if let Err(mut peer) = waiter.send(peer) {
            peer.shutdown().await;
            return Err(TerminalError::UnknownSession(id.to_owned()));
        }
        debug!(client = %agent_id, session_id = %id, "Agent joined terminal.");
        Ok(())
    }

    pub async fn remove(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Runs the browser side of a terminal from request to teardown.
    pub async fn serve_browser(&self, agent_id: &str, mut browser: TerminalPeer) {
        let request = match self.open(agent_id).await {
            Ok(request) => request,
            Err(TerminalError::ClientOffline(_)) => {
                browser.say("Client offline!").await;
                browser.shutdown().await;
                return;
            }
            Err(e) => {
                warn!(client = %agent_id, error = %e, "Terminal request failed.");
                browser.shutdown().await;
                return;
            }
        };

        browser.say("waiting for agent...").await;
        let joined = tokio::time::timeout(self.join_timeout, request.joined);
        tokio::pin!(joined);
        // Input typed before the agent joins is dropped.
        let agent = loop {
            tokio::select! {
                outcome = &mut joined => break outcome.ok().and_then(Result::ok),
                incoming = browser.rx.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        info!(client = %agent_id, session_id = %request.id, "Browser left before agent joined terminal.");
                        self.remove(&request.id).await;
                        browser.shutdown().await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                },
            }
        };
        match agent {
            Some(agent) => {
                bridge(browser, agent).await;
                info!(client = %agent_id, session_id = %request.id, "Terminal session ended.");
            }
            None => {
                info!(client = %agent_id, session_id = %request.id, "Agent never joined terminal.");
                browser.say("timeout").await;
                browser.shutdown().await;
            }
        }
        self.remove(&request.id).await;
    }
}

fn text_as_binary(text: &str) -> Message {
    Message::Binary(Bytes::copy_from_slice(text.as_bytes()))
}

async fn relay_to_agent(
    from: &mut BoxStream<'static, Result<Message, axum::Error>>,
    to: &mut AgentSink,
) {
    while let Some(Ok(message)) = from.next().await {
        let forward = match message {
            // JSON control frames (resize and the like) stay text.
            Message::Text(text) if text.as_str().starts_with('{') => Message::Text(text),
            Message::Text(text) => text_as_binary(text.as_str()),
            Message::Binary(data) => Message::Binary(data),
            Message::Close(_) => break,
            _ => continue,
        };
        if to.send(forward).await.is_err() {
            break;
        }
    }
}

async fn relay_to_browser(
    from: &mut BoxStream<'static, Result<Message, axum::Error>>,
    to: &mut AgentSink,
) {
    while let Some(Ok(message)) = from.next().await {
        let forward = match message {
            Message::Text(text) => text_as_binary(text.as_str()),
            Message::Binary(data) => Message::Binary(data),
            Message::Close(_) => break,
            _ => continue,
        };
        if to.send(forward).await.is_err() {
            break;
        }
    }
}

/// Relays frames both ways until either side ends, then closes both.
pub async fn bridge(mut browser: TerminalPeer, mut agent: TerminalPeer) {
    tokio::select! {
        _ = relay_to_agent(&mut browser.rx, &mut agent.tx) => {}
        _ = relay_to_browser(&mut agent.rx, &mut browser.tx) => {}
    }
    agent.shutdown().await;
    browser.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::agent_state::channel_session;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

    fn peer() -> (TerminalPeer, UnboundedSender<Message>, UnboundedReceiver<Message>) {
        let (in_tx, in_rx) = unbounded::<Message>();
        let (out_tx, out_rx) = unbounded::<Message>();
        let peer = TerminalPeer {
            rx: in_rx.map(Ok).boxed(),
            tx: Box::pin(out_tx.sink_map_err(axum::Error::new)),
        };
        (peer, in_tx, out_rx)
    }

    fn text(message: Option<Message>) -> String {
        match message {
            Some(Message::Text(t)) => t.as_str().to_owned(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_client_is_reported_to_browser() {
        let broker = TerminalBroker::new(ConnectedAgents::new());
        let (browser, _in, mut out) = peer();
        broker.serve_browser("u1", browser).await;
        assert_eq!(text(out.next().await), "Client offline!");
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let agents = ConnectedAgents::new();
        let (session, mut agent_control) = channel_session("u1");
        agents.register(session).unwrap();
        let broker = Arc::new(TerminalBroker::new(agents));

        let (browser, _in, mut out) = peer();
        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.serve_browser("u1", browser).await })
        };

        let request: serde_json::Value = serde_json::from_str(&text(agent_control.next().await)).unwrap();
        assert_eq!(request["message"], "terminal");
        assert_eq!(request["request_id"].as_str().unwrap().len(), 32);
        assert_eq!(text(out.next().await), "waiting for agent...");
        assert_eq!(broker.session_count().await, 1);

        tokio::time::sleep(TERMINAL_JOIN_TIMEOUT + Duration::from_secs(1)).await;
        task.await.unwrap();
        assert_eq!(text(out.next().await), "timeout");
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn browser_leaving_during_wait_drops_the_request() {
        let agents = ConnectedAgents::new();
        let (session, mut agent_control) = channel_session("u1");
        agents.register(session).unwrap();
        let broker = Arc::new(TerminalBroker::new(agents));

        let (browser, browser_in, mut out) = peer();
        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.serve_browser("u1", browser).await })
        };
        let request: serde_json::Value = serde_json::from_str(&text(agent_control.next().await)).unwrap();
        assert_eq!(text(out.next().await), "waiting for agent...");

        browser_in.unbounded_send(Message::Text("ls".into())).unwrap();
        drop(browser_in);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.session_count().await, 0);

        let (agent, _agent_in, _agent_out) = peer();
        let id = request["request_id"].as_str().unwrap();
        assert!(matches!(
            broker.attach(id, "u1", agent).await,
            Err(TerminalError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn joined_session_routes_frames_and_tears_down() {
        let agents = ConnectedAgents::new();
        let (session, mut agent_control) = channel_session("u1");
        agents.register(session).unwrap();
        let broker = Arc::new(TerminalBroker::new(agents));

        let (browser, browser_in, mut browser_out) = peer();
        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.serve_browser("u1", browser).await })
        };
        let request: serde_json::Value = serde_json::from_str(&text(agent_control.next().await)).unwrap();
        let id = request["request_id"].as_str().unwrap().to_owned();
        assert_eq!(text(browser_out.next().await), "waiting for agent...");

        let (intruder, _i_in, _i_out) = peer();
        assert!(matches!(
            broker.attach(&id, "u2", intruder).await,
            Err(TerminalError::WrongClient)
        ));

        let (agent, agent_in, mut agent_out) = peer();
        broker.attach(&id, "u1", agent).await.unwrap();

        browser_in.unbounded_send(Message::Text(r#"{"type":"resize"}"#.into())).unwrap();
        browser_in.unbounded_send(Message::Text("ls\n".into())).unwrap();
        assert!(matches!(agent_out.next().await, Some(Message::Text(t)) if t.as_str() == r#"{"type":"resize"}"#));
        assert!(matches!(agent_out.next().await, Some(Message::Binary(b)) if b.as_ref() == b"ls\n"));

        agent_in.unbounded_send(Message::Text("file.txt".into())).unwrap();
        assert!(matches!(browser_out.next().await, Some(Message::Binary(b)) if b.as_ref() == b"file.txt"));

        // Agent hangs up; the browser side is closed as well.
        drop(agent_in);
        task.await.unwrap();
        assert!(matches!(browser_out.next().await, Some(Message::Close(None))));
        assert_eq!(broker.session_count().await, 0);
    }
}
