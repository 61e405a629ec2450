use axum::{extract::{Extension, State}, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::db::services::client_service::{self, BasicInfo};
use crate::web::middleware::auth::Caller;
use crate::web::{error::AppError, AppState};

/// Agent-authenticated routes.
pub fn client_router() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new().route("/api/clients/uploadBasicInfo", post(upload_basic_info))
}

pub async fn upload_basic_info(
    Extension(caller): Extension<Caller>,
    State(app_state): State<Arc<AppState>>,
    Json(info): Json<BasicInfo>,
) -> Result<Json<Value>, AppError> {
    let uuid = caller
        .client_id
        .ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;
    client_service::update_basic_info(&app_state.db, &uuid, info).await?;
    info!(client = %uuid, "Basic info updated.");
    Ok(Json(json!({ "status": "success" })))
}
