use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::CreateTask;
use crate::errors::Result;
use crate::scheduler::{Task, TriggerOutcome};
use crate::server::AppState;

pub async fn list(State(app): State<AppState>) -> Json<Vec<Task>> {
    Json(app.scheduler.list())
}

pub async fn create(State(app): State<AppState>, Json(body): Json<CreateTask>) -> Result<Json<Task>> {
    app.create_task(body).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: TriggerOutcome,
}

pub async fn trigger(
    State(app): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>> {
    let status = app.scheduler.trigger(&request.job_id)?;
    Ok(Json(TriggerResponse { status }))
}

pub async fn remove(State(app): State<AppState>, Path(job_id): Path<String>) -> Result<Json<serde_json::Value>> {
    app.scheduler.delete(&job_id)?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}
