//! Queue status and administrative purge.

use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::queue::QueueStatus;
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    /// Jobs deleted, in every state
    pub deleted: u64,
}

#[utoipa::path(
    get,
    path = "/queue/status",
    responses(
        (status = 200, description = "Job counts per state", body = QueueStatus, example = json!({
            "waiting": 3, "active": 1, "completed": 42, "failed": 0
        }))
    ),
    tag = "queue"
)]
pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.services.queue.status().await?))
}

#[utoipa::path(
    delete,
    path = "/queue",
    responses(
        (status = 200, description = "Queue purged", body = PurgeResponse)
    ),
    tag = "queue"
)]
pub async fn purge_queue(State(state): State<AppState>) -> Result<Json<PurgeResponse>, ApiError> {
    let deleted = state.services.queue.purge().await?;
    Ok(Json(PurgeResponse { deleted }))
}
