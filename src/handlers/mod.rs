//! # API Handlers
//!
//! Thin HTTP surface over [`SyncServices`](crate::services::SyncServices):
//! on-demand sync, integration status, queue administration and the OAuth
//! connect flow.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;

use crate::db;
use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod integrations;
pub mod oauth;
pub mod queue;

/// Liveness plus database reachability.
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy", body = ServiceInfo),
        (status = 503, description = "Database unreachable", body = ApiError)
    ),
    tag = "health"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<Json<ServiceInfo>, ApiError> {
    db::health_check(&state.services.db).await.map_err(|err| {
        tracing::warn!(error = %err, "health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database unreachable",
        )
    })?;
    Ok(Json(ServiceInfo::default()))
}
