//! Per-integration sync trigger, status read and disconnect.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::integration::{self, SyncStatus};
use crate::models::Provider;
use crate::server::AppState;

/// What the dashboard shows for one integration.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IntegrationStatusResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: Provider,
    pub external_account_id: String,
    pub external_account_name: Option<String>,
    pub active: bool,
    /// `idle`, `syncing` or `error`
    #[schema(example = "idle")]
    pub sync_status: String,
    /// Last successful sync; unchanged by failures
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<serde_json::Value>,
}

impl TryFrom<integration::Model> for IntegrationStatusResponse {
    type Error = ApiError;

    fn try_from(model: integration::Model) -> Result<Self, Self::Error> {
        let provider = model
            .provider()
            .map_err(crate::repositories::RepositoryError::from)?;
        let sync_status = model
            .status()
            .map(SyncStatus::normalized)
            .map(|status| status.as_str().to_string())
            .unwrap_or_else(|_| model.sync_status.clone());
        Ok(Self {
            id: model.id,
            tenant_id: model.tenant_id,
            provider,
            external_account_id: model.external_account_id,
            external_account_name: model.external_account_name,
            active: model.active,
            sync_status,
            last_sync_at: model.last_sync_at.map(|at| at.with_timezone(&Utc)),
            last_error: model.last_error,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncRequestedResponse {
    pub job_id: Uuid,
}

/// Enqueues an immediate sync, independent of the recurring schedule.
#[utoipa::path(
    post,
    path = "/integrations/{id}/sync",
    params(("id" = Uuid, Path, description = "Integration id")),
    responses(
        (status = 202, description = "Sync job enqueued", body = SyncRequestedResponse),
        (status = 404, description = "Unknown integration", body = ApiError),
        (status = 409, description = "Integration is disconnected", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn request_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SyncRequestedResponse>), ApiError> {
    let job_id = state.services.scheduler.request_sync(id).await?;
    Ok((StatusCode::ACCEPTED, Json(SyncRequestedResponse { job_id })))
}

#[utoipa::path(
    get,
    path = "/integrations/{id}/status",
    params(("id" = Uuid, Path, description = "Integration id")),
    responses(
        (status = 200, description = "Current sync status", body = IntegrationStatusResponse),
        (status = 404, description = "Unknown integration", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn integration_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IntegrationStatusResponse>, ApiError> {
    let model = state.services.integrations.require(id).await?;
    Ok(Json(model.try_into()?))
}

/// Marks the integration inactive. Synced campaigns and metrics are kept.
#[utoipa::path(
    delete,
    path = "/integrations/{id}",
    params(("id" = Uuid, Path, description = "Integration id")),
    responses(
        (status = 200, description = "Integration disconnected", body = IntegrationStatusResponse),
        (status = 404, description = "Unknown integration", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn disconnect_integration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IntegrationStatusResponse>, ApiError> {
    let model = state.services.integrations.disconnect(id).await?;
    Ok(Json(model.try_into()?))
}
