//! # Service Object
//!
//! Everything the API and the background runtime share, built once at
//! startup and handed around as `Arc`s. Nothing in the crate reaches for
//! process-global state.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use sea_orm::DatabaseConnection;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapters::{AdapterContext, AdapterRegistry};
use crate::config::AppConfig;
use crate::crypto::{CryptoError, CryptoKey};
use crate::oauth::{OAuthError, TokenManager};
use crate::queue::{JobQueue, QueueError};
use crate::repositories::{CampaignRepository, IntegrationRepository, MetricRepository};
use crate::scheduler::SyncScheduler;
use crate::worker::WorkerPool;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid credential key: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct SyncServices {
    pub db: Arc<DatabaseConnection>,
    pub integrations: Arc<IntegrationRepository>,
    pub campaigns: Arc<CampaignRepository>,
    pub metrics: Arc<MetricRepository>,
    pub tokens: Arc<TokenManager>,
    pub registry: Arc<AdapterRegistry>,
    pub queue: Arc<JobQueue>,
    pub scheduler: Arc<SyncScheduler>,
    pub workers: WorkerPool,
    config: Arc<AppConfig>,
}

impl SyncServices {
    /// Wires repositories, token flows, adapters, queue, scheduler and workers.
    pub fn build(config: &AppConfig, db: DatabaseConnection) -> Result<Self, ServiceError> {
        let crypto_key = match &config.crypto_key {
            Some(bytes) => CryptoKey::new(bytes.clone())?,
            None => {
                warn!("no ADSYNC_CRYPTO_KEY set; using an ephemeral key, stored tokens will not survive a restart");
                CryptoKey::ephemeral()
            }
        };
        Self::build_with_key(config, db, crypto_key)
    }

    pub fn build_with_key(
        config: &AppConfig,
        db: DatabaseConnection,
        crypto_key: CryptoKey,
    ) -> Result<Self, ServiceError> {
        let db = Arc::new(db);
        let integrations = Arc::new(IntegrationRepository::new(db.clone(), crypto_key));
        let tokens = Arc::new(TokenManager::from_config(config, integrations.clone())?);
        let context = AdapterContext {
            integrations: integrations.clone(),
            tokens: tokens.clone(),
            campaigns: Arc::new(CampaignRepository::new(db.clone())),
            metrics: Arc::new(MetricRepository::new(db.clone())),
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(config.worker.adapter_timeout_seconds))
                .build()?,
            window_days: config.worker.sync_window_days,
        };
        let registry = AdapterRegistry::with_defaults(context.clone(), config);
        Ok(Self::assemble(config, db, context, tokens, registry))
    }

    fn assemble(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        context: AdapterContext,
        tokens: Arc<TokenManager>,
        registry: AdapterRegistry,
    ) -> Self {
        let integrations = context.integrations.clone();
        let registry = Arc::new(registry);
        let queue = Arc::new(JobQueue::new(db.clone(), config.queue.clone()));
        let scheduler = Arc::new(SyncScheduler::new(
            queue.clone(),
            integrations.clone(),
            config.scheduler.clone(),
            Duration::seconds(config.worker.stale_claim_seconds as i64),
        ));
        let workers = WorkerPool::new(
            queue.clone(),
            integrations.clone(),
            registry.clone(),
            config.worker.clone(),
        );

        Self {
            db,
            integrations,
            campaigns: context.campaigns,
            metrics: context.metrics,
            tokens,
            registry,
            queue,
            scheduler,
            workers,
            config: Arc::new(config.clone()),
        }
    }

    /// Swaps the adapter registry, rebuilding the worker pool around it.
    pub fn with_registry(self, registry: AdapterRegistry) -> Self {
        let registry = Arc::new(registry);
        let workers = WorkerPool::new(
            self.queue.clone(),
            self.integrations.clone(),
            registry.clone(),
            self.config.worker.clone(),
        );
        Self {
            registry,
            workers,
            ..self
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Starts the scheduler and the worker pool. Both stop when `shutdown`
    /// fires; await the handles to wait for in-flight jobs.
    pub async fn start_background(
        &self,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        let scheduler = self.scheduler.clone().start(shutdown.clone()).await?;
        let workers = self.workers.clone();
        let worker_handle = tokio::spawn(async move { workers.run(shutdown).await });
        Ok(vec![scheduler, worker_handle])
    }
}
