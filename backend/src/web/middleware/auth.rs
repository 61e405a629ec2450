use axum::{
    body::Body as AxumBody,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use sea_orm::{DatabaseConnection, DbErr};
use std::sync::Arc;
use tracing::debug;

use crate::db::services::client_service;
use crate::rpc::registry::Permission;
use crate::server::config::ServerConfig;
use crate::web::{error::AppError, AppState};

/// Cookie holding a dashboard admin session.
pub const SESSION_COOKIE: &str = "session_token";
/// Header carrying the admin API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Who is calling. Computed once per request or connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub permission: Permission,
    /// Set when the caller authenticated with an agent token.
    pub client_id: Option<String>,
}

impl Caller {
    pub fn guest() -> Self {
        Self {
            permission: Permission::Guest,
            client_id: None,
        }
    }

    pub fn admin() -> Self {
        Self {
            permission: Permission::Admin,
            client_id: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.permission == Permission::Admin
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// Classifies in order: admin session cookie, admin API key, agent bearer
/// token. Anything else is a guest.
pub async fn classify(
    config: &ServerConfig,
    db: &DatabaseConnection,
    headers: &HeaderMap,
    jar: &CookieJar,
) -> Result<Caller, DbErr> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if config
            .admin_session_tokens
            .iter()
            .any(|token| token == cookie.value())
        {
            return Ok(Caller::admin());
        }
    }

    if let (Some(expected), Some(given)) = (
        config.api_key.as_deref(),
        headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()),
    ) {
        if expected == given {
            return Ok(Caller::admin());
        }
    }

    if let Some(token) = bearer_token(headers) {
        if let Some(client) = client_service::get_client_by_token(db, &token).await? {
            return Ok(Caller {
                permission: Permission::Client,
                client_id: Some(client.uuid),
            });
        }
        debug!("Bearer token did not match any client.");
    }

    Ok(Caller::guest())
}

fn origin_authority(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}

/// Browser sockets must come from the same host unless CORS is open. A
/// missing `Origin` header means a non-browser client.
pub fn origin_allowed(headers: &HeaderMap, allow_cors: bool) -> bool {
    if allow_cors {
        return true;
    }
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    origin_authority(origin).eq_ignore_ascii_case(host)
}

/// Classifies the caller and stores it as a request extension.
pub async fn auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    let caller = classify(&state.config, &state.db, req.headers(), &jar).await?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    let caller = classify(&state.config, &state.db, req.headers(), &jar).await?;
    if !caller.is_admin() {
        return Err(AppError::Unauthorized("Admin permission required".to_string()));
    }
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

pub async fn require_client(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    let caller = classify(&state.config, &state.db, req.headers(), &jar).await?;
    if caller.client_id.is_none() {
        return Err(AppError::Unauthorized("Invalid token".to_string()));
    }
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
