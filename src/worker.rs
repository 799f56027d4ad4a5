//! # Worker Pool
//!
//! Claims due jobs and runs them on at most `concurrency` tasks at once.
//! A `sync-provider` job syncs one integration; a `sync-all` job expands into
//! one unit per active integration on the same permit pool, so a fleet sync
//! never occupies more than the configured parallelism.
//!
//! Adapter errors stop here: each one becomes an integration status write and
//! a queue retry decision, and never aborts sibling work.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::histogram;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, SyncError, SyncResult};
use crate::config::WorkerConfig;
use crate::models::integration;
use crate::models::sync_job::{self, JobKind, JobPayload};
use crate::queue::{EnqueueOptions, JobQueue, QueueError, RetryDecision, retry_delay};
use crate::repositories::{ClaimOutcome, IntegrationRepository};

/// How one claimed job ended this round.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// Requeued by the retry policy.
    Retrying { attempt: i32, run_at: DateTime<Utc> },
    /// Terminal failure, recorded on the job.
    Failed { error: SyncError },
    /// Integration was busy; requeued without using an attempt.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub kind: String,
    pub outcome: JobOutcome,
}

/// Result of syncing one integration.
#[derive(Debug, Clone, PartialEq)]
enum IntegrationRun {
    Synced(SyncResult),
    /// Another job holds the `syncing` claim.
    Busy,
    /// Disconnected or deleted; nothing to do.
    Skipped(&'static str),
    Failed(SyncError),
}

#[derive(Debug, Default, Serialize)]
struct SyncAllSummary {
    integrations: usize,
    synced: usize,
    busy: usize,
    skipped: usize,
    requeued: Vec<Uuid>,
    failed: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    integrations: Arc<IntegrationRepository>,
    registry: Arc<AdapterRegistry>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("concurrency", &self.config.concurrency)
            .field("available", &self.permits.available_permits())
            .field("registry", &self.registry)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        integrations: Arc<IntegrationRepository>,
        registry: Arc<AdapterRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            integrations,
            registry,
            config,
            permits,
        }
    }

    /// Keeps up to `concurrency` jobs running until `shutdown` fires: each
    /// free permit claims the next due job and runs it on its own task, so a
    /// long job never holds back the queue behind it. Jobs already running
    /// are finished before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "worker pool started");
        let idle = StdDuration::from_millis(self.config.poll_interval_ms);
        let mut running = JoinSet::new();

        loop {
            while let Some(joined) = running.try_join_next() {
                log_joined(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.claim_due(1).await.map(|jobs| jobs.into_iter().next()) {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    let span = job_span(&job);
                    running.spawn(
                        async move { worker.process_job(job, permit).await }.instrument(span),
                    );
                    continue;
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    error!(error = %err, "claiming jobs failed");
                    drop(permit);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(idle) => {}
            }
        }

        while let Some(joined) = running.join_next().await {
            log_joined(joined);
        }
        info!("worker pool stopped");
    }

    /// Claims one batch of due jobs, runs them to their next state and
    /// reports what happened to each. Used by one-shot callers; the long
    /// running loop is [`WorkerPool::run`].
    pub async fn drain_once(&self) -> Result<Vec<JobReport>, QueueError> {
        let available = self.permits.available_permits() as u64;
        let limit = self.config.claim_batch.min(available);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let jobs = self.queue.claim_due(limit).await?;
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            let span = job_span(&job);
            handles.push(tokio::spawn(
                async move { worker.process_job(job, permit).await }.instrument(span),
            ));
        }

        // Claim order, so callers can match reports to what they enqueued.
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(report) = log_joined(handle.await) {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    async fn process_job(
        &self,
        job: sync_job::Model,
        permit: OwnedSemaphorePermit,
    ) -> Result<JobReport, QueueError> {
        let started = Instant::now();
        let outcome = match (job.kind(), job.payload()) {
            (Ok(JobKind::SyncProvider), Ok(payload)) => {
                let outcome = self.run_provider_job(&job, &payload).await;
                drop(permit);
                outcome?
            }
            (Ok(JobKind::SyncAll), Ok(payload)) => {
                // Children draw from the same pool; holding this permit
                // while waiting on them could starve the pool.
                drop(permit);
                self.run_sync_all_job(&job, &payload).await?
            }
            (Err(err), _) => {
                self.settle_failure(&job, SyncError::configuration(err.to_string()))
                    .await?
            }
            (_, Err(err)) => {
                self.settle_failure(
                    &job,
                    SyncError::configuration(format!("invalid payload: {err}")),
                )
                .await?
            }
        };

        histogram!("adsync_job_duration_seconds", "kind" => job.kind.clone())
            .record(started.elapsed().as_secs_f64());
        Ok(JobReport {
            job_id: job.id,
            kind: job.kind.clone(),
            outcome,
        })
    }

    async fn settle_failure(
        &self,
        job: &sync_job::Model,
        error: SyncError,
    ) -> Result<JobOutcome, QueueError> {
        Ok(match self.queue.fail(job, &error).await? {
            RetryDecision::Retry { attempt, run_at } => JobOutcome::Retrying { attempt, run_at },
            RetryDecision::Exhausted | RetryDecision::Terminal => JobOutcome::Failed { error },
        })
    }

    async fn run_provider_job(
        &self,
        job: &sync_job::Model,
        payload: &JobPayload,
    ) -> Result<JobOutcome, QueueError> {
        let Some(integration_id) = payload.integration_id else {
            return self
                .settle_failure(
                    job,
                    SyncError::configuration("sync-provider job without integration_id"),
                )
                .await;
        };

        match self.sync_integration(integration_id).await {
            IntegrationRun::Synced(result) => {
                self.queue.complete(job, json!(result)).await?;
                Ok(JobOutcome::Completed)
            }
            IntegrationRun::Busy => {
                let delay = Duration::milliseconds(self.config.defer_delay_ms as i64);
                self.queue.defer(job, delay).await?;
                Ok(JobOutcome::Deferred)
            }
            IntegrationRun::Skipped(reason) => {
                self.queue
                    .complete(job, json!({ "skipped": reason }))
                    .await?;
                Ok(JobOutcome::Completed)
            }
            IntegrationRun::Failed(error) => self.settle_failure(job, error).await,
        }
    }

    async fn run_sync_all_job(
        &self,
        job: &sync_job::Model,
        payload: &JobPayload,
    ) -> Result<JobOutcome, QueueError> {
        let targets = match self.integrations.list_active(payload.tenant_id).await {
            Ok(targets) => targets,
            Err(err) => return self.settle_failure(job, err.into()).await,
        };
        info!(integrations = targets.len(), tenant_id = ?payload.tenant_id, "expanding sync-all");

        let expansion = self.expand_sync_all(job, targets);
        tokio::pin!(expansion);
        let mut heartbeat = interval(self.heartbeat_period());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let summary = loop {
            tokio::select! {
                summary = &mut expansion => break summary,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.queue.heartbeat(job.id).await {
                        warn!(job_id = %job.id, error = %err, "sync-all heartbeat failed");
                    }
                }
            }
        };

        info!(
            synced = summary.synced,
            busy = summary.busy,
            requeued = summary.requeued.len(),
            failed = summary.failed.len(),
            "sync-all finished"
        );
        self.queue.complete(job, json!(summary)).await?;
        Ok(JobOutcome::Completed)
    }

    /// A third of the stale window, so two missed beats still leave the
    /// parent job fresh.
    fn heartbeat_period(&self) -> StdDuration {
        StdDuration::from_millis(self.config.stale_claim_seconds.saturating_mul(1000) / 3)
            .max(StdDuration::from_millis(100))
    }

    async fn expand_sync_all(
        &self,
        job: &sync_job::Model,
        targets: Vec<integration::Model>,
    ) -> SyncAllSummary {
        let mut handles = Vec::with_capacity(targets.len());
        for integration in targets {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            let span = info_span!(
                "integration",
                integration_id = %integration.id,
                provider = %integration.provider
            );
            handles.push((
                integration.clone(),
                tokio::spawn(
                    async move {
                        let run = worker.sync_integration(integration.id).await;
                        drop(permit);
                        run
                    }
                    .instrument(span),
                ),
            ));
        }

        let mut summary = SyncAllSummary {
            integrations: handles.len(),
            ..SyncAllSummary::default()
        };
        for (integration, handle) in handles {
            let run = handle.await.unwrap_or_else(|err| {
                IntegrationRun::Failed(SyncError::unavailable(format!("sync task aborted: {err}")))
            });
            match run {
                IntegrationRun::Synced(_) => summary.synced += 1,
                IntegrationRun::Busy => summary.busy += 1,
                IntegrationRun::Skipped(_) => summary.skipped += 1,
                IntegrationRun::Failed(error) if error.is_retryable() => {
                    let run_at = Utc::now()
                        + retry_delay(job.backoff_base_ms, 1, error.retry_after_secs());
                    let provider = integration.provider().ok();
                    let child = JobPayload {
                        tenant_id: Some(integration.tenant_id),
                        integration_id: Some(integration.id),
                        provider,
                    };
                    match self
                        .queue
                        .enqueue(
                            JobKind::SyncProvider,
                            &child,
                            EnqueueOptions::delayed_until(run_at),
                        )
                        .await
                    {
                        Ok(child_id) => {
                            debug!(integration_id = %integration.id, %child_id, "retry split off sync-all");
                            summary.requeued.push(integration.id);
                        }
                        Err(err) => {
                            warn!(integration_id = %integration.id, error = %err, "could not requeue integration");
                            summary.failed.push(json!({
                                "integration_id": integration.id,
                                "error": error.to_json(),
                            }));
                        }
                    }
                }
                IntegrationRun::Failed(error) => summary.failed.push(json!({
                    "integration_id": integration.id,
                    "error": error.to_json(),
                })),
            }
        }

        summary
    }

    /// Claim, run the adapter under the deadline, and settle the status.
    async fn sync_integration(&self, integration_id: Uuid) -> IntegrationRun {
        let integration = match self.integrations.claim_for_sync(integration_id).await {
            Ok(ClaimOutcome::Claimed(model)) => model,
            Ok(ClaimOutcome::Busy) => {
                debug!(%integration_id, "integration already syncing");
                return IntegrationRun::Busy;
            }
            Ok(ClaimOutcome::Inactive) => return IntegrationRun::Skipped("inactive"),
            Ok(ClaimOutcome::NotFound) => return IntegrationRun::Skipped("not_found"),
            Err(err) => return IntegrationRun::Failed(err.into()),
        };

        let deadline = StdDuration::from_secs(self.config.adapter_timeout_seconds);
        let result = match integration.provider() {
            Err(err) => Err(SyncError::from(err)),
            Ok(provider) => match self.registry.get(provider) {
                Err(err) => Err(SyncError::configuration(err.to_string())),
                Ok(adapter) => match timeout(deadline, adapter.sync(integration_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::unavailable(format!(
                        "adapter exceeded {}s deadline",
                        deadline.as_secs()
                    ))),
                },
            },
        };

        match result {
            Ok(summary) => match self.integrations.mark_synced(integration_id, Utc::now()).await {
                Ok(_) => {
                    info!(
                        %integration_id,
                        campaigns = summary.campaigns_upserted,
                        metrics = summary.metrics_upserted,
                        "integration synced"
                    );
                    IntegrationRun::Synced(summary)
                }
                Err(err) => {
                    // Leaving the claim in place would block every later job.
                    let error = SyncError::from(err);
                    self.record_error(integration_id, &error).await;
                    IntegrationRun::Failed(error)
                }
            },
            Err(error) => {
                if error.requires_reauth() {
                    warn!(%integration_id, %error, "integration needs re-authorization");
                } else {
                    warn!(%integration_id, %error, "integration sync failed");
                }
                self.record_error(integration_id, &error).await;
                IntegrationRun::Failed(error)
            }
        }
    }

    async fn record_error(&self, integration_id: Uuid, error: &SyncError) {
        if let Err(err) = self
            .integrations
            .mark_error(integration_id, error.to_json())
            .await
        {
            error!(%integration_id, error = %err, "could not record sync error");
        }
    }
}

fn job_span(job: &sync_job::Model) -> tracing::Span {
    info_span!(
        "job",
        job_id = %job.id,
        kind = %job.kind,
        attempt = job.attempt_count
    )
}

fn log_joined(
    joined: Result<Result<JobReport, QueueError>, tokio::task::JoinError>,
) -> Option<JobReport> {
    match joined {
        Ok(Ok(report)) => Some(report),
        Ok(Err(err)) => {
            error!(error = %err, "job bookkeeping failed");
            None
        }
        // Left `active`; stale-job recovery requeues it.
        Err(err) => {
            error!(error = %err, "job task panicked");
            None
        }
    }
}
