//! # Server Configuration
//!
//! Router, OpenAPI document and the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers;
use crate::services::SyncServices;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<SyncServices>,
}

impl AppState {
    pub fn new(services: SyncServices) -> Self {
        Self {
            services: Arc::new(services),
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/queue/status", get(handlers::queue::queue_status))
        .route("/queue", delete(handlers::queue::purge_queue))
        .route(
            "/integrations/{id}",
            delete(handlers::integrations::disconnect_integration),
        )
        .route(
            "/integrations/{id}/status",
            get(handlers::integrations::integration_status),
        )
        .route(
            "/integrations/{id}/sync",
            post(handlers::integrations::request_sync),
        )
        .route("/oauth/{provider}/authorize", get(handlers::oauth::authorize))
        .route("/oauth/{provider}/callback", get(handlers::oauth::callback))
        .layer(middleware::from_fn(telemetry::trace_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Serves the API until `shutdown` fires.
pub async fn run_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("api stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::healthz,
        crate::handlers::queue::queue_status,
        crate::handlers::queue::purge_queue,
        crate::handlers::integrations::request_sync,
        crate::handlers::integrations::integration_status,
        crate::handlers::integrations::disconnect_integration,
        crate::handlers::oauth::authorize,
        crate::handlers::oauth::callback,
    ),
    components(
        schemas(
            crate::error::ApiError,
            crate::models::ServiceInfo,
            crate::models::Provider,
            crate::queue::QueueStatus,
            crate::handlers::queue::PurgeResponse,
            crate::handlers::integrations::IntegrationStatusResponse,
            crate::handlers::integrations::SyncRequestedResponse,
            crate::handlers::oauth::AuthorizeResponse,
        )
    ),
    tags(
        (name = "health", description = "Liveness"),
        (name = "integrations", description = "Per-integration sync control"),
        (name = "queue", description = "Job queue administration"),
        (name = "oauth", description = "Provider connect flow"),
    ),
    info(
        title = "adsync API",
        description = "Ad platform and storefront sync service",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::crypto::CryptoKey;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use tower::ServiceExt;

    async fn app() -> Router {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let config = AppConfig {
            profile: "test".to_string(),
            ..AppConfig::default()
        };
        let key = CryptoKey::new(vec![1u8; 32]).unwrap();
        let services = SyncServices::build_with_key(&config, db, key).unwrap();
        create_app(AppState::new(services))
    }

    #[tokio::test]
    async fn openapi_document_lists_every_route() {
        let response = app()
            .await
            .oneshot(Request::get("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let paths = doc["paths"].as_object().unwrap();
        for path in [
            "/healthz",
            "/queue",
            "/queue/status",
            "/integrations/{id}",
            "/integrations/{id}/status",
            "/integrations/{id}/sync",
            "/oauth/{provider}/authorize",
            "/oauth/{provider}/callback",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
    }

    #[tokio::test]
    async fn caller_trace_id_is_echoed() {
        let response = app()
            .await
            .oneshot(
                Request::get("/healthz")
                    .header(telemetry::TRACE_HEADER, "trace-abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(telemetry::TRACE_HEADER).unwrap(),
            "trace-abc"
        );
    }
}
