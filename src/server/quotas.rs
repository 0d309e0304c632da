use axum::extract::{Path, State};
use axum::Json;

use crate::admission::{AcquireRequest, AcquireResponse};
use crate::errors::Result;
use crate::quota::{NewQuota, QuotaPatch, QuotaView};
use crate::server::AppState;

pub async fn list(State(app): State<AppState>) -> Json<Vec<QuotaView>> {
    Json(app.list_quotas())
}

pub async fn get(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<QuotaView>> {
    app.get_quota(&id).map(Json)
}

pub async fn create(
    State(app): State<AppState>,
    Json(body): Json<NewQuota>,
) -> Result<Json<QuotaView>> {
    app.create_quota(body).await.map(Json)
}

pub async fn update(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<QuotaPatch>,
) -> Result<Json<QuotaView>> {
    app.update_quota(&id, patch).await.map(Json)
}

pub async fn toggle(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<QuotaView>> {
    app.toggle_quota(&id).await.map(Json)
}

pub async fn remove(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    app.delete_quota(&id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

/// A denial is a normal answer (`allow: false`), not an error status.
pub async fn acquire(
    State(app): State<AppState>,
    Json(request): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>> {
    let admission = app.gate.acquire(&request).await?;
    Ok(Json(AcquireResponse::from(&admission)))
}
