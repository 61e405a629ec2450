use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

pub type AgentSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session does not accept pushed frames")]
    PushUnsupported,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write frame: {0}")]
    Send(#[from] axum::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Token already in use")]
    AlreadyConnected(String),
}

/// Outbound half of an agent session.
#[derive(Clone)]
pub enum AgentSender {
    /// All writes go through the mutex so frames never interleave.
    WebSocket(Arc<Mutex<AgentSink>>),
    /// Legacy gRPC sessions; the old protocol has no push channel.
    Legacy,
}

impl AgentSender {
    pub fn from_sink<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        AgentSender::WebSocket(Arc::new(Mutex::new(Box::pin(sink))))
    }
}

static LAST_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Stamps a new session. Values follow the wall clock in nanoseconds and are
/// strictly increasing within the process.
pub fn next_connection_id() -> u64 {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns as u64)
        .unwrap_or_default();
    let mut prev = LAST_CONNECTION_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_CONNECTION_ID.compare_exchange_weak(
            prev,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

pub struct AgentSession {
    pub agent_id: String,
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    sender: AgentSender,
    closed: AtomicBool,
    failed: AtomicBool,
    /// Wakes the reader when the session must end from the write side.
    shutdown: Notify,
}

impl AgentSession {
    pub fn new(agent_id: impl Into<String>, connection_id: u64, sender: AgentSender) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            agent_id: agent_id.into(),
            connection_id,
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            sender,
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn accepts_push(&self) -> bool {
        matches!(self.sender, AgentSender::WebSocket(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once a write failed. The reader tears the session down.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Resolves once the session failed on write or was closed.
    pub async fn closing(&self) {
        if self.is_failed() || self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }

    fn mark_failed(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }

    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() || self.is_failed() {
            return Err(SessionError::Closed);
        }
        match &self.sender {
            AgentSender::WebSocket(sink) => {
                let mut guard = sink.lock().await;
                if let Err(e) = guard.send(message).await {
                    drop(guard);
                    debug!(client = %self.agent_id, connection_id = self.connection_id, error = %e, "Agent write failed.");
                    self.mark_failed();
                    return Err(SessionError::Send(e));
                }
                Ok(())
            }
            AgentSender::Legacy => Err(SessionError::PushUnsupported),
        }
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SessionError> {
        let text = serde_json::to_string(value)?;
        self.send(Message::Text(text.into())).await
    }

    /// Closes the underlying socket. Only the first call has an effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_one();
        if let AgentSender::WebSocket(sink) = &self.sender {
            let mut guard = sink.lock().await;
            let _ = guard.send(Message::Close(None)).await;
            if let Err(e) = guard.close().await {
                debug!(client = %self.agent_id, error = %e, "Error closing agent socket.");
            }
        }
    }
}

/// Presence registry: at most one live session per agent.
#[derive(Default)]
pub struct ConnectedAgents {
    agents: DashMap<String, Arc<AgentSession>>,
}

impl ConnectedAgents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session: Arc<AgentSession>) -> Result<(), RegistryError> {
        match self.agents.entry(session.agent_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyConnected(session.agent_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Removes the entry only if it still holds `session`.
    pub fn deregister(&self, agent_id: &str, session: &Arc<AgentSession>) -> bool {
        self.agents
            .remove_if(agent_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<AgentSession>> {
        self.agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn online_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Session whose outbound frames land in an in-memory channel.
#[cfg(test)]
pub(crate) fn channel_session(
    agent_id: &str,
) -> (
    Arc<AgentSession>,
    futures::channel::mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
    let sender = AgentSender::from_sink(tx.sink_map_err(axum::Error::new));
    (AgentSession::new(agent_id, next_connection_id(), sender), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn connection_ids_strictly_increase() {
        let mut last = 0;
        for _ in 0..1000 {
            let id = next_connection_id();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn second_registration_is_rejected() {
        let registry = ConnectedAgents::new();
        let (first, _rx1) = channel_session("u1");
        let (second, _rx2) = channel_session("u1");

        registry.register(first.clone()).unwrap();
        assert_eq!(
            registry.register(second.clone()),
            Err(RegistryError::AlreadyConnected("u1".into()))
        );
        assert!(Arc::ptr_eq(&registry.get("u1").unwrap(), &first));
    }

    #[tokio::test]
    async fn stale_deregister_keeps_fresh_session() {
        let registry = ConnectedAgents::new();
        let (old, _rx1) = channel_session("u1");
        let (fresh, _rx2) = channel_session("u1");

        registry.register(old.clone()).unwrap();
        assert!(registry.deregister("u1", &old));
        registry.register(fresh.clone()).unwrap();

        assert!(!registry.deregister("u1", &old));
        assert!(registry.is_online("u1"));
        assert!(registry.deregister("u1", &fresh));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_writers_produce_whole_frames() {
        let (session, rx) = channel_session("u1");
        let mut handles = Vec::new();
        for i in 0..20 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                session
                    .send_json(&serde_json::json!({ "message": "ping", "n": i }))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(session);

        let frames: Vec<Message> = rx.collect().await;
        assert_eq!(frames.len(), 20);
        for frame in frames {
            let Message::Text(text) = frame else {
                panic!("expected text frame");
            };
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["message"], "ping");
        }
    }

    #[tokio::test]
    async fn close_happens_once_and_blocks_further_sends() {
        let (session, mut rx) = channel_session("u1");
        session.close().await;
        session.close().await;
        assert!(matches!(rx.next().await, Some(Message::Close(None))));
        assert!(rx.next().await.is_none());
        assert!(matches!(
            session.send(Message::Text("x".into())).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn failed_write_marks_the_session_and_wakes_the_reader() {
        let (session, rx) = channel_session("u1");
        drop(rx);

        let err = session.send(Message::Text("x".into())).await.unwrap_err();
        assert!(matches!(err, SessionError::Send(_)));
        assert!(session.is_failed());
        tokio::time::timeout(std::time::Duration::from_secs(1), session.closing())
            .await
            .unwrap();
        assert!(matches!(
            session.send(Message::Text("y".into())).await,
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn legacy_sessions_reject_push() {
        let session = AgentSession::new("u1", next_connection_id(), AgentSender::Legacy);
        assert!(!session.accepts_push());
    }
}
