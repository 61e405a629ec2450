use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::{SinkExt, StreamExt};
use sea_orm::DbErr;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::services::client_service;
use crate::server::report_cache::Report;
use crate::web::middleware::auth::{classify, origin_allowed, Caller};
use crate::web::{error::AppError, AppState};

#[derive(Debug, Serialize)]
pub struct LiveStatus {
    pub online: Vec<String>,
    pub data: HashMap<String, Report>,
}

#[derive(Serialize)]
struct LiveStatusReply<'a> {
    status: &'static str,
    data: &'a LiveStatus,
}

/// Online agents and their latest reports. Hidden agents are left out
/// unless the caller is an admin.
pub async fn live_status(state: &AppState, caller: &Caller) -> Result<LiveStatus, DbErr> {
    let hidden = if caller.is_admin() {
        HashSet::new()
    } else {
        client_service::hidden_client_ids(&state.db).await?
    };
    let online = state
        .agent_context
        .agents
        .online_ids()
        .into_iter()
        .filter(|id| !hidden.contains(id))
        .collect();
    let data = state.agent_context.reports.snapshot_filtered(&hidden).await;
    Ok(LiveStatus { online, data })
}

/// Private sites hide everything from guests.
pub fn ensure_visible(state: &AppState, caller: &Caller) -> Result<(), AppError> {
    if state.current_settings().private_site && caller.client_id.is_none() && !caller.is_admin() {
        return Err(AppError::Unauthorized("Login required".to_string()));
    }
    Ok(())
}

pub async fn live_status_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    if !origin_allowed(&headers, app_state.current_settings().allow_cors) {
        return Err(AppError::Forbidden("Origin not allowed".to_string()));
    }
    let caller = classify(&app_state.config, &app_state.db, &headers, &jar).await?;
    ensure_visible(&app_state, &caller)?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, app_state, caller))
        .into_response())
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, caller: Caller) {
    let (mut sender, mut receiver) = socket.split();
    while let Some(Ok(msg)) = receiver.next().await {
        let reply = match msg {
            Message::Text(t) if t.as_str() == "get" => match live_status(&app_state, &caller).await {
                Ok(status) => serde_json::to_string(&LiveStatusReply {
                    status: "success",
                    data: &status,
                })
                .unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "Failed to build live status.");
                    serde_json::json!({ "status": "error", "message": "Database error" }).to_string()
                }
            },
            Message::Text(t) => {
                debug!(text = %t.as_str(), "Unknown live status request ignored.");
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };
        if sender.send(Message::Text(Utf8Bytes::from(reply))).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}
