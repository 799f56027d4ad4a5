//! # Sync Scheduler
//!
//! Registers the standing fleet-wide `sync-all` schedule and runs the
//! housekeeping tick: due schedules become jobs, expired jobs are purged and
//! claims abandoned by dead workers are released. Every step is idempotent,
//! so several instances may tick the same database.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::histogram;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::models::job_schedule;
use crate::models::sync_job::{JobKind, JobPayload};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};
use crate::repositories::{IntegrationRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("integration {0} is disconnected")]
    IntegrationInactive(Uuid),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub jobs_materialized: u64,
    pub jobs_purged: u64,
    pub stale_jobs_recovered: u64,
    pub stale_claims_released: u64,
    /// Steps that returned an error this tick
    pub failed_steps: u32,
}

impl TickStats {
    fn record_failure(&mut self, step: &'static str, err: &dyn std::fmt::Display) {
        self.failed_steps += 1;
        error!(step, error = %err, "scheduler tick step failed");
    }
}

pub struct SyncScheduler {
    queue: Arc<JobQueue>,
    integrations: Arc<IntegrationRepository>,
    config: SchedulerConfig,
    stale_after: Duration,
}

impl SyncScheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        integrations: Arc<IntegrationRepository>,
        config: SchedulerConfig,
        stale_after: Duration,
    ) -> Self {
        Self {
            queue,
            integrations,
            config,
            stale_after,
        }
    }

    /// Registers the recurring fleet sync. Safe to call on every start.
    pub async fn register_recurring(&self) -> Result<job_schedule::Model, QueueError> {
        self.queue
            .enqueue_recurring(
                JobKind::SyncAll,
                &JobPayload::fleet(),
                &self.config.recurring_cron,
                &self.config.recurring_dedupe_key,
            )
            .await
    }

    /// Registers the recurring schedule, then ticks in the background until
    /// `shutdown` fires.
    pub async fn start(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, QueueError> {
        let schedule = self.register_recurring().await?;
        info!(
            dedupe_key = %schedule.dedupe_key,
            next_run_at = %schedule.next_run_at,
            "recurring sync registered"
        );
        Ok(tokio::spawn(async move { self.run(shutdown).await }))
    }

    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("sync scheduler started");
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds);

        loop {
            let tick_started = Instant::now();
            self.tick(Utc::now()).await;
            histogram!("adsync_scheduler_tick_duration_seconds")
                .record(tick_started.elapsed().as_secs_f64());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(tick_interval) => {}
            }
        }

        info!("sync scheduler stopped");
    }

    /// Runs every housekeeping step. Steps are independent: a failing one is
    /// logged and counted, and the others still run.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickStats {
        let stale_cutoff = now - self.stale_after;
        let mut stats = TickStats::default();

        match self.queue.materialize_due_schedules(now).await {
            Ok(count) => stats.jobs_materialized = count,
            Err(err) => stats.record_failure("materialize", &err),
        }
        match self.queue.purge_expired(now).await {
            Ok(count) => stats.jobs_purged = count,
            Err(err) => stats.record_failure("purge_expired", &err),
        }
        match self.queue.recover_stale_jobs(stale_cutoff).await {
            Ok(count) => stats.stale_jobs_recovered = count,
            Err(err) => stats.record_failure("recover_stale_jobs", &err),
        }
        match self.integrations.release_stale_claims(stale_cutoff).await {
            Ok(count) => stats.stale_claims_released = count,
            Err(err) => stats.record_failure("release_stale_claims", &err),
        }

        debug!(?stats, "scheduler tick");
        stats
    }

    /// Enqueues an immediate sync of one integration. Not deduplicated against
    /// the recurring schedule or earlier requests.
    pub async fn request_sync(&self, integration_id: Uuid) -> Result<Uuid, SchedulerError> {
        let integration = self.integrations.require(integration_id).await?;
        if !integration.active {
            return Err(SchedulerError::IntegrationInactive(integration_id));
        }
        let provider = integration.provider().map_err(RepositoryError::from)?;
        let job_id = self
            .queue
            .enqueue(
                JobKind::SyncProvider,
                &JobPayload::integration(integration.tenant_id, integration.id, provider),
                EnqueueOptions::default(),
            )
            .await?;
        info!(%job_id, %integration_id, %provider, "on-demand sync requested");
        Ok(job_id)
    }

    /// Enqueues an immediate `sync-all` for one tenant.
    pub async fn request_tenant_sync(&self, tenant_id: Uuid) -> Result<Uuid, SchedulerError> {
        let job_id = self
            .queue
            .enqueue(
                JobKind::SyncAll,
                &JobPayload::tenant(tenant_id),
                EnqueueOptions::default(),
            )
            .await?;
        info!(%job_id, %tenant_id, "tenant sync requested");
        Ok(job_id)
    }
}
