//! HTTP surface driven through the router with `tower::ServiceExt::oneshot`.

mod test_utils;

use std::collections::BTreeMap;

use adsync::models::Provider;
use adsync::server::{AppState, create_app};
use anyhow::Result;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use test_utils::{build_services, seed_active, test_config};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn json_body(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_method(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn healthz_reports_service_and_trace_id() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let app = create_app(AppState::new(services));

    let response = app.oneshot(get("/healthz")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-trace-id"));
    let body = json_body(response).await?;
    assert_eq!(body["service"], "adsync");
    Ok(())
}

#[tokio::test]
async fn sync_request_is_accepted_and_visible_in_queue() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let integration = seed_active(&services, Uuid::new_v4(), Provider::Meta, "act_1").await?;
    let app = create_app(AppState::new(services));

    let response = app
        .clone()
        .oneshot(with_method("POST", &format!("/integrations/{}/sync", integration.id)))
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await?;
    assert!(body["job_id"].as_str().is_some());

    let status = json_body(app.oneshot(get("/queue/status")).await?).await?;
    assert_eq!(
        status,
        json!({ "waiting": 1, "active": 0, "completed": 0, "failed": 0 })
    );
    Ok(())
}

#[tokio::test]
async fn unknown_integration_is_problem_json_404() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let app = create_app(AppState::new(services));

    let response = app
        .oneshot(get(&format!("/integrations/{}/status", Uuid::new_v4())))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let body = json_body(response).await?;
    assert_eq!(body["code"], "NOT_FOUND");
    assert!(body["trace_id"].as_str().is_some());
    Ok(())
}

#[tokio::test]
async fn disconnect_then_sync_is_conflict() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let integration = seed_active(&services, Uuid::new_v4(), Provider::Meta, "act_1").await?;
    let app = create_app(AppState::new(services));

    let response = app
        .clone()
        .oneshot(with_method("DELETE", &format!("/integrations/{}", integration.id)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["active"], false);
    assert_eq!(body["provider"], "meta");

    let response = app
        .oneshot(with_method("POST", &format!("/integrations/{}/sync", integration.id)))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await?["code"], "INTEGRATION_INACTIVE");
    Ok(())
}

#[tokio::test]
async fn status_reports_idle_for_fresh_integration() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let integration =
        seed_active(&services, Uuid::new_v4(), Provider::GoogleAds, "1234567890").await?;
    let app = create_app(AppState::new(services));

    let body = json_body(
        app.oneshot(get(&format!("/integrations/{}/status", integration.id)))
            .await?,
    )
    .await?;
    assert_eq!(body["sync_status"], "idle");
    assert_eq!(body["provider"], "google-ads");
    assert!(body["last_sync_at"].is_null());
    Ok(())
}

#[tokio::test]
async fn purge_empties_the_queue() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let tenant = Uuid::new_v4();
    services.scheduler.request_tenant_sync(tenant).await?;
    services.scheduler.request_tenant_sync(tenant).await?;
    let app = create_app(AppState::new(services));

    let body = json_body(app.clone().oneshot(with_method("DELETE", "/queue")).await?).await?;
    assert_eq!(body["deleted"], 2);
    let status = json_body(app.oneshot(get("/queue/status")).await?).await?;
    assert_eq!(status["waiting"], 0);
    Ok(())
}

#[tokio::test]
async fn authorize_requires_configured_provider() -> Result<()> {
    let services = build_services(&test_config()).await?;
    let app = create_app(AppState::new(services));

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/oauth/meta/authorize?tenant_id={}",
            Uuid::new_v4()
        )))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

    let response = app
        .oneshot(get(&format!(
            "/oauth/tiktok/authorize?tenant_id={}",
            Uuid::new_v4()
        )))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

fn sign(secret: &str, params: &BTreeMap<&str, String>) -> String {
    let message = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn shopify_callback_verifies_hmac_and_connects() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/admin/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "shpat_1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-01/shop.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shop": { "name": "Demo", "myshopify_domain": "demo.myshopify.com" }
        })))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.shopify_api_key = Some("key".to_string());
    config.shopify_api_secret = Some("secret".to_string());
    config.shopify_redirect_uri = Some("http://localhost/oauth/shopify/callback".to_string());
    config.shopify_api_base = Some(server.uri());
    let services = build_services(&config).await?;
    let app = create_app(AppState::new(services));

    let tenant = Uuid::new_v4();
    let mut params = BTreeMap::new();
    params.insert("code", "auth-code".to_string());
    params.insert("shop", "demo.myshopify.com".to_string());
    params.insert("state", tenant.to_string());
    params.insert("timestamp", "1700000000".to_string());
    let signature = sign("secret", &params);
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let forged = app
        .clone()
        .oneshot(get(&format!("/oauth/shopify/callback?{query}&hmac=00ff")))
        .await?;
    assert_eq!(forged.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(get(&format!("/oauth/shopify/callback?{query}&hmac={signature}")))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await?;
    assert_eq!(body["tenant_id"], tenant.to_string());
    assert_eq!(body["external_account_id"], "demo.myshopify.com");
    assert_eq!(body["active"], true);
    Ok(())
}
