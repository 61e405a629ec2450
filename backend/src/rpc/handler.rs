use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::rpc::methods::RpcContext;
use crate::web::middleware::auth::{classify, origin_allowed, Caller};
use crate::web::{error::AppError, AppState};

/// JSON-RPC over WebSocket. The caller is classified once, at upgrade.
pub async fn rpc_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    if !origin_allowed(&headers, app_state.current_settings().allow_cors) {
        return Err(AppError::Forbidden("Origin not allowed".to_string()));
    }
    let caller = classify(&app_state.config, &app_state.db, &headers, &jar).await?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, app_state, caller))
        .into_response())
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, caller: Caller) {
    info!(permission = ?caller.permission, "RPC connection opened.");
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let ctx = RpcContext::new(app_state.clone(), caller);

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        // Each message runs on its own task; replies share the writer lock.
        let registry = app_state.rpc.clone();
        let ctx = ctx.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let Some(reply) = registry.handle_text(ctx, &text).await else {
                return;
            };
            let mut sink = sink.lock().await;
            if let Err(e) = sink.send(Message::Text(reply.into())).await {
                debug!(error = %e, "Failed to write RPC reply.");
            }
        });
    }
    debug!("RPC connection closed.");
}

/// Single-shot JSON-RPC over HTTP POST.
pub async fn rpc_http_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
    body: String,
) -> Result<Response, AppError> {
    let caller = classify(&app_state.config, &app_state.db, &headers, &jar).await?;
    let ctx = RpcContext::new(app_state.clone(), caller);
    match app_state.rpc.handle_text(ctx, &body).await {
        Some(reply) => Ok(([(header::CONTENT_TYPE, "application/json")], reply).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
