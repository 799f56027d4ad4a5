//! Scheduler housekeeping against a real (SQLite) database.

mod test_utils;

use adsync::models::Provider;
use adsync::models::integration::SyncStatus;
use adsync::repositories::ClaimOutcome;
use anyhow::Result;
use chrono::{Duration, Utc};
use sea_orm::ConnectionTrait;
use test_utils::{build_services, seed_active, test_config};
use uuid::Uuid;

#[tokio::test]
async fn tick_releases_stale_claims() -> Result<()> {
    let config = test_config();
    let services = build_services(&config).await?;
    let integration = seed_active(&services, Uuid::new_v4(), Provider::Meta, "act_1").await?;
    assert!(matches!(
        services.integrations.claim_for_sync(integration.id).await?,
        ClaimOutcome::Claimed(_)
    ));

    let later = Utc::now() + Duration::seconds(config.worker.stale_claim_seconds as i64 + 10);
    let stats = services.scheduler.tick(later).await;
    assert_eq!(stats.failed_steps, 0);
    assert_eq!(stats.stale_claims_released, 1);

    let stored = services.integrations.require(integration.id).await?;
    assert_eq!(stored.status()?, SyncStatus::Error);
    assert_eq!(stored.last_error.as_ref().unwrap()["type"], "abandoned");
    Ok(())
}

#[tokio::test]
async fn failing_step_does_not_skip_the_rest_of_the_tick() -> Result<()> {
    let config = test_config();
    let services = build_services(&config).await?;
    let integration = seed_active(&services, Uuid::new_v4(), Provider::Shopify, "a.myshopify.com").await?;
    services.integrations.claim_for_sync(integration.id).await?;
    services
        .db
        .execute_unprepared("DROP TABLE job_schedules")
        .await?;

    let later = Utc::now() + Duration::seconds(config.worker.stale_claim_seconds as i64 + 10);
    let stats = services.scheduler.tick(later).await;
    assert_eq!(stats.failed_steps, 1);
    assert_eq!(stats.jobs_materialized, 0);
    assert_eq!(stats.stale_claims_released, 1);
    assert_eq!(
        services.integrations.require(integration.id).await?.status()?,
        SyncStatus::Error
    );
    Ok(())
}
