//! Shared fixtures: in-memory SQLite with migrations, a wired service
//! object, seeded integrations and a scripted adapter.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use adsync::adapters::{AdapterRegistry, SyncAdapter, SyncError, SyncResult};
use adsync::config::AppConfig;
use adsync::crypto::CryptoKey;
use adsync::models::{Provider, integration};
use adsync::oauth::{AccountIdentity, TokenGrant};
use adsync::repositories::IntegrationRepository;
use adsync::services::SyncServices;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("32 byte key")
}

/// Test profile with fast timings and no provider credentials.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    config.queue.backoff_base_ms = 10;
    config.worker.concurrency = 4;
    config.worker.poll_interval_ms = 10;
    config.worker.adapter_timeout_seconds = 2;
    config.worker.defer_delay_ms = 50;
    config
}

pub async fn build_services(config: &AppConfig) -> Result<SyncServices> {
    let db = setup_test_db().await?;
    Ok(SyncServices::build_with_key(config, db, test_key())?)
}

/// Services whose registry only holds the given adapters.
pub async fn services_with_adapters(
    config: &AppConfig,
    adapters: Vec<Arc<dyn SyncAdapter>>,
) -> Result<SyncServices> {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    Ok(build_services(config).await?.with_registry(registry))
}

pub fn grant(access: &str, refresh: Option<&str>, expires_at: Option<DateTime<Utc>>) -> TokenGrant {
    TokenGrant {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_at,
    }
}

/// Connects an integration as an OAuth callback would.
pub async fn seed_integration(
    integrations: &IntegrationRepository,
    tenant_id: Uuid,
    provider: Provider,
    external_account_id: &str,
    token: TokenGrant,
) -> Result<integration::Model> {
    let account = AccountIdentity {
        external_account_id: external_account_id.to_string(),
        external_account_name: Some(format!("{provider} account")),
    };
    Ok(integrations
        .upsert_from_grant(tenant_id, provider, &account, &token)
        .await?)
}

pub async fn seed_active(
    services: &SyncServices,
    tenant_id: Uuid,
    provider: Provider,
    external_account_id: &str,
) -> Result<integration::Model> {
    seed_integration(
        &services.integrations,
        tenant_id,
        provider,
        external_account_id,
        grant("access-token", None, None),
    )
    .await
}

/// Adapter that replays scripted results and records every call.
pub struct ScriptedAdapter {
    provider: Provider,
    script: Mutex<VecDeque<Result<SyncResult, SyncError>>>,
    delay: Option<StdDuration>,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, result: Result<SyncResult, SyncError>) {
        self.script.lock().await.push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn synced(campaigns: usize, metrics: usize) -> Result<SyncResult, SyncError> {
    Ok(SyncResult {
        campaigns_upserted: campaigns,
        metrics_upserted: metrics,
    })
}

#[async_trait]
impl SyncAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn sync(&self, _integration_id: Uuid) -> Result<SyncResult, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().await.pop_front();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| synced(0, 0))
    }
}
