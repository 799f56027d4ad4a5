//! OAuth connect flow: authorization URL out, callback in.
//!
//! The tenant id travels through the provider as the opaque `state` value.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::integrations::IntegrationStatusResponse;
use crate::error::{ApiError, validation_error};
use crate::models::Provider;
use crate::oauth::{ExchangeExtra, TokenFlow};
use crate::server::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct AuthorizeQuery {
    pub tenant_id: Uuid,
    /// Required for Shopify: `{shop}.myshopify.com`
    pub shop: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeResponse {
    pub authorize_url: String,
}

fn parse_provider(raw: &str) -> Result<Provider, ApiError> {
    raw.parse()
        .map_err(|_| validation_error(&format!("unknown provider '{raw}'")))
}

#[utoipa::path(
    get,
    path = "/oauth/{provider}/authorize",
    params(
        ("provider" = String, Path, description = "google-ads, meta or shopify"),
        AuthorizeQuery
    ),
    responses(
        (status = 200, description = "Provider consent URL", body = AuthorizeResponse),
        (status = 400, description = "Unknown provider or missing shop", body = ApiError),
        (status = 501, description = "Provider credentials not configured", body = ApiError)
    ),
    tag = "oauth"
)]
pub async fn authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Json<AuthorizeResponse>, ApiError> {
    let provider = parse_provider(&provider)?;
    let extra = ExchangeExtra { shop: query.shop };
    let url = state
        .services
        .tokens
        .authorize_url(provider, &query.tenant_id.to_string(), &extra)?;
    Ok(Json(AuthorizeResponse {
        authorize_url: url.to_string(),
    }))
}

/// Exchanges the code and creates (or re-authorizes) the integration.
#[utoipa::path(
    get,
    path = "/oauth/{provider}/callback",
    params(("provider" = String, Path, description = "google-ads, meta or shopify")),
    responses(
        (status = 201, description = "Integration connected", body = IntegrationStatusResponse),
        (status = 400, description = "Missing code, bad state or bad signature", body = ApiError),
        (status = 502, description = "Provider rejected the exchange", body = ApiError)
    ),
    tag = "oauth"
)]
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<(StatusCode, Json<IntegrationStatusResponse>), ApiError> {
    let provider = parse_provider(&provider)?;
    if let Some(error) = params.get("error") {
        return Err(validation_error(&format!("authorization denied: {error}")));
    }
    let code = params
        .get("code")
        .ok_or_else(|| validation_error("callback is missing code"))?;
    let tenant_id: Uuid = params
        .get("state")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| validation_error("callback state is not a tenant id"))?;

    let tokens = &state.services.tokens;
    if let TokenFlow::NonExpiring(shopify) = tokens.flow(provider)? {
        shopify.verify_callback(&params)?;
    }

    let extra = ExchangeExtra {
        shop: params.get("shop").cloned(),
    };
    let model = tokens.connect(tenant_id, provider, code, &extra).await?;
    Ok((StatusCode::CREATED, Json(model.try_into()?)))
}
