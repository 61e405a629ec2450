use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::db::services::client_service;
use crate::server::terminal::TerminalPeer;
use crate::web::middleware::auth::{bearer_token, origin_allowed};
use crate::web::{error::AppError, AppState};

#[derive(Deserialize, Debug)]
pub struct AgentTerminalQuery {
    id: String,
    token: Option<String>,
}

/// Browser side. Admin only; mounted under the admin router.
pub async fn browser_terminal_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !origin_allowed(&headers, app_state.current_settings().allow_cors) {
        return Err(AppError::Forbidden("Origin not allowed".to_string()));
    }
    if client_service::get_client_by_uuid(&app_state.db, &uuid)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound(format!("Client {uuid} not found")));
    }
    info!(client = %uuid, "Browser terminal requested.");
    Ok(ws
        .on_upgrade(move |socket| async move {
            app_state
                .terminals
                .serve_browser(&uuid, TerminalPeer::from_socket(socket))
                .await;
        })
        .into_response())
}

/// Agent side, answering a `terminal` request with its session id.
pub async fn agent_terminal_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<AgentTerminalQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = query
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| AppError::Unauthorized("Missing token".to_string()))?;
    let client = client_service::get_client_by_token(&app_state.db, &token)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;

    let session_id = query.id;
    Ok(ws
        .on_upgrade(move |socket| async move {
            let peer = TerminalPeer::from_socket(socket);
            if let Err(e) = app_state
                .terminals
                .attach(&session_id, &client.uuid, peer)
                .await
            {
                warn!(client = %client.uuid, session_id = %session_id, error = %e, "Agent terminal join rejected.");
            }
        })
        .into_response())
}
