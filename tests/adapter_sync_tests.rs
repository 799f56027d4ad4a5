//! Provider adapters against mocked APIs: parsing, paging, idempotent
//! upserts and error classification.

mod test_utils;

use adsync::adapters::SyncErrorKind;
use adsync::config::AppConfig;
use adsync::models::Provider;
use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use test_utils::{build_services, grant, seed_integration, test_config};
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mocked(server: &MockServer) -> AppConfig {
    let mut config = test_config();
    config.google_ads_developer_token = Some("dev-token".to_string());
    config.google_ads_api_base = server.uri();
    config.meta_graph_base = server.uri();
    config.shopify_api_base = Some(server.uri());
    config
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn yesterday() -> String {
    (Utc::now().date_naive() - Duration::days(1))
        .format("%Y-%m-%d")
        .to_string()
}

#[tokio::test]
async fn google_ads_pages_and_upserts_idempotently() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v17/customers/1234567890/googleAds:search"))
        .and(header("developer-token", "dev-token"))
        .and(body_string_contains("segments.date"))
        .and(body_string_contains("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "campaign": { "id": "111", "name": "Brand", "status": "ENABLED" },
                "segments": { "date": yesterday() },
                "metrics": { "impressions": "500", "clicks": "10", "costMicros": "2500000", "conversions": 1.0 }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v17/customers/1234567890/googleAds:search"))
        .and(body_string_contains("segments.date"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "campaign": { "id": "111", "name": "Brand", "status": "ENABLED" },
                "segments": { "date": today() },
                "metrics": { "impressions": "1000", "clicks": "50", "costMicros": "12500000", "conversions": 5.0 }
            }],
            "nextPageToken": "page-2"
        })))
        .mount(&server)
        .await;
    // Campaign list: a paused campaign with no rows in the window is still synced.
    Mock::given(method("POST"))
        .and(path("/v17/customers/1234567890/googleAds:search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "campaign": { "id": "111", "name": "Brand", "status": "ENABLED" } },
                { "campaign": { "id": "222", "name": "Prospecting", "status": "PAUSED" } }
            ]
        })))
        .mount(&server)
        .await;

    let services = build_services(&mocked(&server)).await?;
    let integration = seed_integration(
        &services.integrations,
        Uuid::new_v4(),
        Provider::GoogleAds,
        "123-456-7890",
        grant("access", Some("refresh"), Some(Utc::now() + Duration::hours(1))),
    )
    .await?;
    let adapter = services.registry.get(Provider::GoogleAds)?;

    let first = adapter.sync(integration.id).await.map_err(anyhow::Error::msg)?;
    assert_eq!(first.campaigns_upserted, 2);
    assert_eq!(first.metrics_upserted, 2);

    // Same window again: rows are overwritten, not duplicated.
    adapter.sync(integration.id).await.map_err(anyhow::Error::msg)?;
    let campaigns = services.campaigns.list_for_integration(integration.id).await?;
    assert_eq!(campaigns.len(), 2);
    let brand = campaigns
        .iter()
        .find(|c| c.external_id == "111")
        .expect("reporting campaign");
    let paused = campaigns
        .iter()
        .find(|c| c.external_id == "222")
        .expect("campaign without rows");
    assert_eq!(paused.status.as_deref(), Some("PAUSED"));
    assert!(services.metrics.list_for_campaign(paused.id).await?.is_empty());

    let metrics = services.metrics.list_for_campaign(brand.id).await?;
    assert_eq!(metrics.len(), 2);
    let latest = metrics
        .iter()
        .find(|m| m.date == Utc::now().date_naive())
        .expect("today's row");
    assert_eq!(latest.impressions, 1000);
    assert!((latest.spend - 12.5).abs() < 1e-9);
    assert!((latest.ctr.unwrap() - 0.05).abs() < 1e-9);
    assert!((latest.cpc.unwrap() - 0.25).abs() < 1e-9);
    assert!((latest.cpa.unwrap() - 2.5).abs() < 1e-9);
    assert!(latest.roas.is_none());
    Ok(())
}

#[tokio::test]
async fn google_ads_rate_limit_carries_retry_after() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "42"))
        .mount(&server)
        .await;

    let services = build_services(&mocked(&server)).await?;
    let integration = seed_integration(
        &services.integrations,
        Uuid::new_v4(),
        Provider::GoogleAds,
        "1234567890",
        grant("access", Some("refresh"), Some(Utc::now() + Duration::hours(1))),
    )
    .await?;

    let err = services
        .registry
        .get(Provider::GoogleAds)?
        .sync(integration.id)
        .await
        .unwrap_err();
    assert_eq!(
        err.kind,
        SyncErrorKind::RateLimited {
            retry_after_secs: Some(42)
        }
    );
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn meta_reads_campaigns_and_purchase_conversions() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v18.0/act_42/campaigns"))
        .and(query_param("access_token", "meta-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "c1", "name": "Prospecting", "status": "ACTIVE" },
                { "id": "c2", "name": "Retargeting", "status": "PAUSED" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v18.0/act_42/insights"))
        .and(query_param("level", "campaign"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "campaign_id": "c1",
                "date_start": today(),
                "date_stop": today(),
                "impressions": "2000",
                "clicks": "40",
                "spend": "20.00",
                "actions": [
                    { "action_type": "link_click", "value": "40" },
                    { "action_type": "purchase", "value": "4" }
                ]
            }]
        })))
        .mount(&server)
        .await;

    let services = build_services(&mocked(&server)).await?;
    let integration = seed_integration(
        &services.integrations,
        Uuid::new_v4(),
        Provider::Meta,
        "42",
        grant("meta-token", None, Some(Utc::now() + Duration::days(50))),
    )
    .await?;

    let result = services
        .registry
        .get(Provider::Meta)?
        .sync(integration.id)
        .await
        .map_err(anyhow::Error::msg)?;
    assert_eq!(result.campaigns_upserted, 2);
    assert_eq!(result.metrics_upserted, 1);

    let campaigns = services.campaigns.list_for_integration(integration.id).await?;
    let metrics = services.metrics.list_for_campaign(campaigns[0].id).await?;
    assert_eq!(metrics[0].conversions, 4.0);
    assert!((metrics[0].cpa.unwrap() - 5.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn meta_expired_token_code_maps_to_auth_expired() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "Session has expired", "type": "OAuthException", "code": 190 }
        })))
        .mount(&server)
        .await;

    let services = build_services(&mocked(&server)).await?;
    let integration = seed_integration(
        &services.integrations,
        Uuid::new_v4(),
        Provider::Meta,
        "act_42",
        grant("meta-token", None, Some(Utc::now() + Duration::days(50))),
    )
    .await?;

    let err = services
        .registry
        .get(Provider::Meta)?
        .sync(integration.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind, SyncErrorKind::AuthExpired);
    assert!(err.requires_reauth());
    Ok(())
}

#[tokio::test]
async fn shopify_rolls_orders_into_daily_revenue() -> Result<()> {
    let server = MockServer::start().await;
    let second_page = format!("{}/admin/api/2024-01/orders.json?page_info=abc", server.uri());
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-01/orders.json"))
        .and(query_param("page_info", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orders": [
                { "id": 3, "created_at": format!("{}T15:00:00+00:00", today()), "total_price": "30.00", "cancelled_at": null }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-01/orders.json"))
        .and(header("X-Shopify-Access-Token", "shpat_offline"))
        .and(query_param("status", "any"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Link", format!("<{second_page}>; rel=\"next\"").as_str())
                .set_body_json(json!({
                    "orders": [
                        { "id": 1, "created_at": format!("{}T09:00:00+00:00", today()), "total_price": "20.50", "cancelled_at": null },
                        { "id": 2, "created_at": format!("{}T10:00:00+00:00", today()), "total_price": "99.00", "cancelled_at": "2026-01-01T00:00:00Z" }
                    ]
                })),
        )
        .mount(&server)
        .await;

    let services = build_services(&mocked(&server)).await?;
    let integration = seed_integration(
        &services.integrations,
        Uuid::new_v4(),
        Provider::Shopify,
        "demo.myshopify.com",
        grant("shpat_offline", None, None),
    )
    .await?;

    let result = services
        .registry
        .get(Provider::Shopify)?
        .sync(integration.id)
        .await
        .map_err(anyhow::Error::msg)?;
    assert_eq!(result.campaigns_upserted, 1);
    assert_eq!(result.metrics_upserted, 1);

    let campaigns = services.campaigns.list_for_integration(integration.id).await?;
    assert_eq!(campaigns[0].external_id, "orders");
    let metrics = services.metrics.list_for_campaign(campaigns[0].id).await?;
    assert_eq!(metrics[0].conversions, 2.0);
    assert!((metrics[0].revenue.unwrap() - 50.5).abs() < 1e-9);
    assert_eq!(metrics[0].spend, 0.0);
    assert!(metrics[0].roas.is_none());
    Ok(())
}
