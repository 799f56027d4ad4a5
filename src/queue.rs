//! # Job Queue
//!
//! Durable queue on the `sync_jobs` table. Every state transition is a
//! filtered `UPDATE` on the row's expected state, so two workers (or two
//! processes) can race on the same job and exactly one wins.
//!
//! Deduplication is enforced by the database: a partial unique index allows at
//! most one `waiting`/`active` row per `dedupe_key`. A colliding insert
//! surfaces as [`QueueError::DuplicateJob`], which callers suppress.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use metrics::{counter, gauge};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::SyncError;
use crate::config::QueueConfig;
use crate::models::job_schedule::{self, Entity as JobSchedule};
use crate::models::sync_job::{self, Column, Entity as SyncJob, JobKind, JobPayload, JobState};
use crate::repositories::is_unique_violation;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    /// A waiting or active job already carries this key. Not a failure.
    #[error("a job with dedupe key '{dedupe_key}' is already waiting or active")]
    DuplicateJob { dedupe_key: String },
    #[error("invalid cron expression '{spec}': {message}")]
    InvalidSchedule { spec: String, message: String },
    #[error("invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub run_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub max_attempts: Option<i32>,
}

impl EnqueueOptions {
    pub fn deduplicated(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn delayed_until(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..Self::default()
        }
    }
}

/// Counts per job state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueStatus {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `waiting`, claimable again at `run_at`.
    Retry { attempt: i32, run_at: DateTime<Utc> },
    /// Retryable failure, but the attempt cap is reached.
    Exhausted,
    /// Non-retryable failure.
    Terminal,
}

/// Exponential backoff: the delay after attempt `n` is `base * 2^(n-1)`,
/// raised to the provider's `Retry-After` hint when that is longer.
pub fn retry_delay(base_ms: i64, attempt: i32, retry_after_secs: Option<u64>) -> Duration {
    let exponent = attempt.clamp(1, 20) - 1;
    let backoff = Duration::milliseconds(base_ms.max(0).saturating_mul(1_i64 << exponent));
    match retry_after_secs {
        Some(secs) => backoff.max(Duration::seconds(secs.min(i64::MAX as u64) as i64)),
        None => backoff,
    }
}

fn parse_cron(spec: &str) -> Result<Schedule, QueueError> {
    Schedule::from_str(spec).map_err(|e| QueueError::InvalidSchedule {
        spec: spec.to_string(),
        message: e.to_string(),
    })
}

fn next_fire(schedule: &Schedule, after: DateTime<Utc>, spec: &str) -> Result<DateTime<Utc>, QueueError> {
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| QueueError::InvalidSchedule {
            spec: spec.to_string(),
            message: "schedule never fires".to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Arc<DatabaseConnection>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(db: Arc<DatabaseConnection>, config: QueueConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<sync_job::Model>, QueueError> {
        Ok(SyncJob::find_by_id(id).one(&*self.db).await?)
    }

    /// Inserts a waiting job and returns its id.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let model = sync_job::ActiveModel {
            id: Set(id),
            kind: Set(kind.as_str().to_string()),
            payload: Set(serde_json::to_value(payload)?),
            state: Set(JobState::Waiting.as_str().to_string()),
            attempt_count: Set(0),
            max_attempts: Set(options.max_attempts.unwrap_or(self.config.max_attempts)),
            backoff_base_ms: Set(self.config.backoff_base_ms as i64),
            dedupe_key: Set(options.dedupe_key.clone()),
            run_at: Set(options.run_at.unwrap_or(now).fixed_offset()),
            started_at: Set(None),
            finished_at: Set(None),
            last_error: Set(None),
            result: Set(None),
            created_at: Set(now.fixed_offset()),
            updated_at: Set(now.fixed_offset()),
        };

        match SyncJob::insert(model).exec_without_returning(&*self.db).await {
            Ok(_) => {
                debug!(job_id = %id, %kind, dedupe_key = ?options.dedupe_key, "job enqueued");
                Ok(id)
            }
            Err(err) if is_unique_violation(&err) => Err(QueueError::DuplicateJob {
                dedupe_key: options.dedupe_key.unwrap_or_default(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Registers a standing schedule under `dedupe_key`. Registering the same
    /// key again updates the schedule in place instead of adding another one.
    pub async fn enqueue_recurring(
        &self,
        kind: JobKind,
        payload: &JobPayload,
        cron_spec: &str,
        dedupe_key: &str,
    ) -> Result<job_schedule::Model, QueueError> {
        let schedule = parse_cron(cron_spec)?;
        let now = Utc::now();
        let payload = serde_json::to_value(payload)?;

        let existing = JobSchedule::find()
            .filter(job_schedule::Column::DedupeKey.eq(dedupe_key))
            .one(&*self.db)
            .await?;
        if let Some(existing) = existing {
            if existing.cron_spec == cron_spec
                && existing.kind == kind.as_str()
                && existing.payload == payload
            {
                return Ok(existing);
            }
            let next_run_at = next_fire(&schedule, now, cron_spec)?;
            JobSchedule::update_many()
                .col_expr(job_schedule::Column::Kind, Expr::value(kind.as_str()))
                .col_expr(job_schedule::Column::Payload, Expr::value(payload))
                .col_expr(job_schedule::Column::CronSpec, Expr::value(cron_spec))
                .col_expr(
                    job_schedule::Column::NextRunAt,
                    Expr::value(next_run_at.fixed_offset()),
                )
                .col_expr(job_schedule::Column::UpdatedAt, Expr::value(now.fixed_offset()))
                .filter(job_schedule::Column::Id.eq(existing.id))
                .exec(&*self.db)
                .await?;
            info!(dedupe_key, cron_spec, "recurring schedule updated");
            return self.require_schedule(dedupe_key).await;
        }

        let model = job_schedule::ActiveModel {
            id: Set(Uuid::new_v4()),
            dedupe_key: Set(dedupe_key.to_string()),
            kind: Set(kind.as_str().to_string()),
            payload: Set(payload),
            cron_spec: Set(cron_spec.to_string()),
            next_run_at: Set(next_fire(&schedule, now, cron_spec)?.fixed_offset()),
            last_enqueued_at: Set(None),
            created_at: Set(now.fixed_offset()),
            updated_at: Set(now.fixed_offset()),
        };
        match JobSchedule::insert(model).exec_without_returning(&*self.db).await {
            Ok(_) => info!(dedupe_key, cron_spec, "recurring schedule registered"),
            // Another process registered it first.
            Err(err) if is_unique_violation(&err) => {
                debug!(dedupe_key, "recurring schedule already registered")
            }
            Err(err) => return Err(err.into()),
        }
        self.require_schedule(dedupe_key).await
    }

    async fn require_schedule(&self, dedupe_key: &str) -> Result<job_schedule::Model, QueueError> {
        JobSchedule::find()
            .filter(job_schedule::Column::DedupeKey.eq(dedupe_key))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                QueueError::Database(DbErr::RecordNotFound(format!(
                    "job schedule '{dedupe_key}'"
                )))
            })
    }

    pub async fn schedules(&self) -> Result<Vec<job_schedule::Model>, QueueError> {
        Ok(JobSchedule::find()
            .order_by_asc(job_schedule::Column::DedupeKey)
            .all(&*self.db)
            .await?)
    }

    /// Turns every due schedule into a job. A schedule whose previous job is
    /// still waiting or active is advanced without a new job.
    pub async fn materialize_due_schedules(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let due = JobSchedule::find()
            .filter(job_schedule::Column::NextRunAt.lte(now.fixed_offset()))
            .all(&*self.db)
            .await?;

        let mut materialized = 0;
        for schedule in due {
            let cron = parse_cron(&schedule.cron_spec)?;
            let next_run_at = next_fire(&cron, now, &schedule.cron_spec)?;

            // Whoever advances `next_run_at` owns this firing.
            let advanced = JobSchedule::update_many()
                .col_expr(
                    job_schedule::Column::NextRunAt,
                    Expr::value(next_run_at.fixed_offset()),
                )
                .col_expr(job_schedule::Column::UpdatedAt, Expr::value(now.fixed_offset()))
                .filter(job_schedule::Column::Id.eq(schedule.id))
                .filter(job_schedule::Column::NextRunAt.eq(schedule.next_run_at))
                .exec(&*self.db)
                .await?;
            if advanced.rows_affected != 1 {
                continue;
            }

            let kind = JobKind::from_str(&schedule.kind).map_err(|e| {
                QueueError::InvalidSchedule {
                    spec: schedule.cron_spec.clone(),
                    message: e.to_string(),
                }
            })?;
            let payload: JobPayload = serde_json::from_value(schedule.payload.clone())?;
            match self
                .enqueue(kind, &payload, EnqueueOptions::deduplicated(&schedule.dedupe_key))
                .await
            {
                Ok(job_id) => {
                    materialized += 1;
                    JobSchedule::update_many()
                        .col_expr(
                            job_schedule::Column::LastEnqueuedAt,
                            Expr::value(Some(now.fixed_offset())),
                        )
                        .filter(job_schedule::Column::Id.eq(schedule.id))
                        .exec(&*self.db)
                        .await?;
                    info!(%job_id, dedupe_key = %schedule.dedupe_key, "recurring job enqueued");
                }
                Err(QueueError::DuplicateJob { dedupe_key }) => {
                    debug!(%dedupe_key, "previous recurring job still in flight");
                }
                Err(err) => return Err(err),
            }
        }

        if materialized > 0 {
            counter!("adsync_scheduler_jobs_materialized_total").increment(materialized);
        }
        Ok(materialized)
    }

    async fn count_state(&self, state: JobState) -> Result<u64, QueueError> {
        Ok(SyncJob::find()
            .filter(Column::State.eq(state.as_str()))
            .count(&*self.db)
            .await?)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let status = QueueStatus {
            waiting: self.count_state(JobState::Waiting).await?,
            active: self.count_state(JobState::Active).await?,
            completed: self.count_state(JobState::Completed).await?,
            failed: self.count_state(JobState::Failed).await?,
        };
        gauge!("adsync_queue_depth").set(status.waiting as f64);
        Ok(status)
    }

    /// Deletes every job in every state. Standing schedules are kept and
    /// fire again on their next tick.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let deleted = SyncJob::delete_many().exec(&*self.db).await?.rows_affected;
        warn!(deleted, "job queue purged");
        Ok(deleted)
    }

    /// Claims up to `limit` due jobs, oldest `run_at` first. Each claim is a
    /// compare-and-set from `waiting`, so concurrent claimers never share a job.
    pub async fn claim_due(&self, limit: u64) -> Result<Vec<sync_job::Model>, QueueError> {
        let now = Utc::now().fixed_offset();
        let candidates: Vec<Uuid> = SyncJob::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::State.eq(JobState::Waiting.as_str()))
            .filter(Column::RunAt.lte(now))
            .order_by_asc(Column::RunAt)
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let result = SyncJob::update_many()
                .col_expr(Column::State, Expr::value(JobState::Active.as_str()))
                .col_expr(Column::AttemptCount, Expr::col(Column::AttemptCount).add(1))
                .col_expr(Column::StartedAt, Expr::value(Some(now)))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::Id.eq(id))
                .filter(Column::State.eq(JobState::Waiting.as_str()))
                .exec(&*self.db)
                .await?;
            if result.rows_affected == 1 {
                if let Some(job) = self.get(id).await? {
                    claimed.push(job);
                }
            }
        }

        if !claimed.is_empty() {
            counter!("adsync_jobs_claimed_total").increment(claimed.len() as u64);
        }
        Ok(claimed)
    }

    async fn transition_from_active(
        &self,
        job_id: Uuid,
        update: sea_orm::UpdateMany<SyncJob>,
    ) -> Result<(), QueueError> {
        let result = update
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .filter(Column::State.eq(JobState::Active.as_str()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 1 {
            Ok(())
        } else {
            Err(QueueError::JobNotFound(job_id))
        }
    }

    pub async fn complete(&self, job: &sync_job::Model, result: JsonValue) -> Result<(), QueueError> {
        let now = Utc::now().fixed_offset();
        self.transition_from_active(
            job.id,
            SyncJob::update_many()
                .col_expr(Column::State, Expr::value(JobState::Completed.as_str()))
                .col_expr(Column::FinishedAt, Expr::value(Some(now)))
                .col_expr(Column::Result, Expr::value(Some(result))),
        )
        .await?;
        counter!("adsync_jobs_completed_total", "kind" => job.kind.clone()).increment(1);
        Ok(())
    }

    /// Applies the retry policy to a failed attempt.
    pub async fn fail(
        &self,
        job: &sync_job::Model,
        error: &SyncError,
    ) -> Result<RetryDecision, QueueError> {
        let now = Utc::now();
        let error_json = Some(error.to_json());

        if error.is_retryable() && job.attempts_remaining() {
            let delay = retry_delay(
                job.backoff_base_ms,
                job.attempt_count,
                error.retry_after_secs(),
            );
            let run_at = now + delay;
            self.transition_from_active(
                job.id,
                SyncJob::update_many()
                    .col_expr(Column::State, Expr::value(JobState::Waiting.as_str()))
                    .col_expr(Column::RunAt, Expr::value(run_at.fixed_offset()))
                    .col_expr(Column::LastError, Expr::value(error_json)),
            )
            .await?;
            counter!("adsync_jobs_retried_total", "kind" => job.kind.clone()).increment(1);
            info!(
                job_id = %job.id,
                attempt = job.attempt_count,
                delay_ms = delay.num_milliseconds(),
                "job scheduled for retry"
            );
            return Ok(RetryDecision::Retry {
                attempt: job.attempt_count,
                run_at,
            });
        }

        self.transition_from_active(
            job.id,
            SyncJob::update_many()
                .col_expr(Column::State, Expr::value(JobState::Failed.as_str()))
                .col_expr(Column::FinishedAt, Expr::value(Some(now.fixed_offset())))
                .col_expr(Column::LastError, Expr::value(error_json)),
        )
        .await?;
        counter!("adsync_jobs_failed_total", "kind" => job.kind.clone()).increment(1);

        let decision = if error.is_retryable() {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Terminal
        };
        warn!(job_id = %job.id, attempt = job.attempt_count, ?decision, %error, "job failed");
        Ok(decision)
    }

    /// Puts an active job back without consuming the attempt it was claimed with.
    pub async fn defer(&self, job: &sync_job::Model, delay: Duration) -> Result<(), QueueError> {
        let run_at = Utc::now() + delay;
        self.transition_from_active(
            job.id,
            SyncJob::update_many()
                .col_expr(Column::State, Expr::value(JobState::Waiting.as_str()))
                .col_expr(Column::RunAt, Expr::value(run_at.fixed_offset()))
                .col_expr(Column::AttemptCount, Expr::col(Column::AttemptCount).sub(1))
                .col_expr(
                    Column::StartedAt,
                    Expr::value(Option::<chrono::DateTime<chrono::FixedOffset>>::None),
                ),
        )
        .await?;
        counter!("adsync_jobs_deferred_total").increment(1);
        debug!(job_id = %job.id, delay_ms = delay.num_milliseconds(), "job deferred");
        Ok(())
    }

    /// Drops terminal jobs past their retention window, and completed jobs
    /// beyond the retention count.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let completed_cutoff =
            now - Duration::seconds(self.config.completed_retention_seconds as i64);
        let failed_cutoff = now - Duration::seconds(self.config.failed_retention_seconds as i64);

        let mut deleted = SyncJob::delete_many()
            .filter(Column::State.eq(JobState::Completed.as_str()))
            .filter(Column::FinishedAt.lt(completed_cutoff.fixed_offset()))
            .exec(&*self.db)
            .await?
            .rows_affected;
        deleted += SyncJob::delete_many()
            .filter(Column::State.eq(JobState::Failed.as_str()))
            .filter(Column::FinishedAt.lt(failed_cutoff.fixed_offset()))
            .exec(&*self.db)
            .await?
            .rows_affected;

        let overflow: Vec<Uuid> = SyncJob::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::State.eq(JobState::Completed.as_str()))
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::Id)
            // SQLite only accepts OFFSET after a LIMIT.
            .limit(i64::MAX as u64)
            .offset(self.config.completed_retention_count)
            .into_tuple()
            .all(&*self.db)
            .await?;
        if !overflow.is_empty() {
            deleted += SyncJob::delete_many()
                .filter(Column::Id.is_in(overflow))
                .exec(&*self.db)
                .await?
                .rows_affected;
        }

        if deleted > 0 {
            debug!(deleted, "expired jobs purged");
        }
        Ok(deleted)
    }

    /// Marks an active job as still owned. Long `sync-all` expansions call
    /// this so stale-job recovery leaves them alone.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.transition_from_active(job_id, SyncJob::update_many()).await
    }

    /// Recovers jobs left `active` by a crashed worker: no transition or
    /// heartbeat since `older_than`. Jobs with attempts left go back to
    /// `waiting`; the rest fail as abandoned.
    pub async fn recover_stale_jobs(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let now = Utc::now().fixed_offset();
        let cutoff = older_than.fixed_offset();
        let abandoned = serde_json::json!({
            "type": "abandoned",
            "message": "worker stopped before finishing the job",
        });

        let failed = SyncJob::update_many()
            .col_expr(Column::State, Expr::value(JobState::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Some(now)))
            .col_expr(Column::LastError, Expr::value(Some(abandoned.clone())))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::State.eq(JobState::Active.as_str()))
            .filter(Column::UpdatedAt.lt(cutoff))
            .filter(Expr::col(Column::AttemptCount).gte(Expr::col(Column::MaxAttempts)))
            .exec(&*self.db)
            .await?
            .rows_affected;

        let requeued = SyncJob::update_many()
            .col_expr(Column::State, Expr::value(JobState::Waiting.as_str()))
            .col_expr(Column::RunAt, Expr::value(now))
            .col_expr(Column::LastError, Expr::value(Some(abandoned)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::State.eq(JobState::Active.as_str()))
            .filter(Column::UpdatedAt.lt(cutoff))
            .exec(&*self.db)
            .await?
            .rows_affected;

        if failed + requeued > 0 {
            warn!(failed, requeued, "recovered stale active jobs");
        }
        Ok(failed + requeued)
    }
}
