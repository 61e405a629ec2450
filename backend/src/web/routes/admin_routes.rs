use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::db::services::task_service;
use crate::web::handlers::terminal_handler::browser_terminal_handler;
use crate::web::{error::AppError, AppState};

#[derive(Deserialize, Debug)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub clients: Vec<String>,
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/task/exec", post(exec_task))
        .route("/task/{task_id}", get(task_results))
        .route("/client/{uuid}/terminal", get(browser_terminal_handler))
}

pub async fn exec_task(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<Value>, AppError> {
    let task = app_state
        .dispatcher
        .dispatch(&request.command, &request.clients)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "task_id": task.task_id,
        "clients": task.clients,
    })))
}

pub async fn task_results(
    State(app_state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let task = task_service::get_task(&app_state.db, &task_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Task {task_id} not found")))?;
    let results = task_service::get_task_results(&app_state.db, &task_id).await?;
    Ok(Json(json!({
        "status": "success",
        "task": task,
        "results": results,
    })))
}
