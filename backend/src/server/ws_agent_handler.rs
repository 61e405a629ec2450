use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::services::client_service;
use crate::server::agent_state::{next_connection_id, AgentSender, AgentSink};
use crate::server::core_services;
use crate::web::middleware::auth::bearer_token;
use crate::web::{error::AppError, AppState};

/// How long an agent that did not authenticate on upgrade has to send its
/// token frame.
pub const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize, Debug)]
pub struct AgentAuthQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
struct TokenFrame {
    token: String,
}

/// Agent report socket. A token in the query or `Authorization` header is
/// checked before the upgrade; otherwise the first frame must carry it.
pub async fn ws_agent_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<AgentAuthQuery>,
    headers: HeaderMap,
) -> Response {
    let agent_id = match query.token.or_else(|| bearer_token(&headers)) {
        Some(token) => match client_service::get_client_by_token(&app_state.db, &token).await {
            Ok(Some(client)) => Some(client.uuid),
            Ok(None) => {
                return AppError::Unauthorized("Invalid token".to_string()).into_response();
            }
            Err(e) => return AppError::from(e).into_response(),
        },
        None => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, agent_id))
}

async fn authenticate_first_frame(
    stream: &mut SplitStream<WebSocket>,
    db: &DatabaseConnection,
) -> Result<String, &'static str> {
    let first = tokio::time::timeout(FIRST_FRAME_TIMEOUT, stream.next())
        .await
        .map_err(|_| "Authentication timeout")?;
    let Some(Ok(Message::Text(text))) = first else {
        return Err("Missing token");
    };
    let frame: TokenFrame = serde_json::from_str(text.as_str()).map_err(|_| "Missing token")?;
    match client_service::get_client_by_token(db, &frame.token).await {
        Ok(Some(client)) => Ok(client.uuid),
        Ok(None) => Err("Invalid token"),
        Err(e) => {
            warn!(error = %e, "Token lookup failed.");
            Err("Internal error")
        }
    }
}

async fn reject(sink: &Mutex<AgentSink>, message: &str) {
    let frame = serde_json::json!({ "status": "error", "message": message }).to_string();
    let mut sink = sink.lock().await;
    let _ = sink.send(Message::Text(frame.into())).await;
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, agent_id: Option<String>) {
    let (sink, mut stream) = socket.split();
    let sink: AgentSink = Box::pin(sink);
    let sink = Arc::new(Mutex::new(sink));

    let agent_id = match agent_id {
        Some(id) => id,
        None => match authenticate_first_frame(&mut stream, &app_state.db).await {
            Ok(id) => id,
            Err(message) => {
                warn!(reason = message, "Agent socket failed first-frame authentication.");
                reject(&sink, message).await;
                return;
            }
        },
    };

    let context = app_state.agent_context.clone();
    let connection_id = next_connection_id();
    let session = match context
        .open_session(&agent_id, connection_id, AgentSender::WebSocket(sink.clone()))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            info!(client = %agent_id, connection_id, "Duplicate agent session rejected.");
            reject(&sink, &e.to_string()).await;
            return;
        }
    };

    core_services::process_agent_stream(stream, session, context).await;
}
