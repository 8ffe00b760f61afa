//! Job dispatcher
//!
//! Durable queue and worker pool executing mirror synchronizations. Jobs
//! live in the sync_jobs table; a partial unique index keeps at most one
//! queued-or-running job per repository, so enqueueing an already-pending
//! repository is a deduplicated no-op. Workers claim due jobs atomically,
//! run the mirror operator under bounded concurrency, and either record the
//! outcome or requeue with exponential backoff. Jobs abandoned by a crashed
//! worker become re-claimable once the visibility timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use sea_orm::prelude::*;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, QueryTrait, Set, TransactionTrait,
};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::is_unique_violation;
use crate::mirror::{MirrorError, MirrorErrorKind, MirrorOperator, SyncOutcome};
use crate::models::repository;
use crate::models::sync_job::{
    self, Entity as SyncJob, JOB_STATUS_FAILED, JOB_STATUS_QUEUED, JOB_STATUS_RUNNING,
    JOB_STATUS_SUCCEEDED,
};
use crate::repositories::{DirectoryError, RecordedOutcome, RepositoryDirectory};

/// Errors surfaced by dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// What `enqueue` did for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new job row was created
    Enqueued,
    /// A job for the repository was already pending; nothing was created
    Deduplicated,
}

/// Durable queue plus worker pool for mirror synchronization jobs.
#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<DatabaseConnection>,
    operator: Arc<dyn MirrorOperator>,
    directory: RepositoryDirectory,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a new dispatcher over the shared connection pool.
    pub fn new(
        db: Arc<DatabaseConnection>,
        operator: Arc<dyn MirrorOperator>,
        directory: RepositoryDirectory,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            operator,
            directory,
            config,
        }
    }

    /// Get the dispatcher configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Enqueue one sync job for a repository.
    ///
    /// The pending-guard index rejects a second queued-or-running job for
    /// the same repository; that rejection is the single-concurrent-job
    /// guarantee and is reported as a successful [`EnqueueResult::Deduplicated`].
    pub async fn enqueue(&self, repository_id: Uuid) -> Result<EnqueueResult, DispatchError> {
        let now = Utc::now();
        let job = sync_job::ActiveModel {
            id: Set(Uuid::new_v4()),
            repository_id: Set(repository_id),
            status: Set(JOB_STATUS_QUEUED.to_string()),
            attempts: Set(0),
            scheduled_at: Set(now.into()),
            retry_after: Set(None),
            started_at: Set(None),
            finished_at: Set(None),
            error: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        match job.insert(self.db.as_ref()).await {
            Ok(_) | Err(DbErr::UnpackInsertId) => {
                counter!("sync_jobs_enqueued_total").increment(1);
                Ok(EnqueueResult::Enqueued)
            }
            Err(err) if is_unique_violation(&err) => {
                debug!(
                    repository_id = %repository_id,
                    "Job already pending for repository; enqueue deduplicated"
                );
                Ok(EnqueueResult::Deduplicated)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run the dispatcher loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DispatchError> {
        info!(
            concurrency = self.config.concurrency,
            tick_ms = self.config.tick_ms,
            "Starting job dispatcher"
        );
        let tick = Duration::from_millis(self.config.tick_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job dispatcher shutdown requested");
                    break;
                }
                _ = sleep(tick) => {
                    let started = Instant::now();

                    if let Err(err) = self.reclaim_stale_jobs().await {
                        error!(error = ?err, "Failed to reclaim stale jobs");
                    }

                    match self.claim_and_run_jobs(&shutdown).await {
                        Ok(count) if count > 0 => debug!("Executed {} sync jobs", count),
                        Ok(_) => {}
                        Err(err) => error!(error = ?err, "Error executing sync jobs"),
                    }

                    histogram!("dispatcher_tick_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job dispatcher stopped");
        Ok(())
    }

    /// Return running jobs whose worker never finished to the queue.
    ///
    /// A worker crash (or process kill) leaves the row in `running`; once
    /// `started_at` is older than the visibility timeout the job becomes
    /// claimable again. Attempts already counted stay counted.
    pub async fn reclaim_stale_jobs(&self) -> Result<u64, DispatchError> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.visibility_timeout_seconds as i64);

        let result = SyncJob::update_many()
            .col_expr(sync_job::Column::Status, Expr::value(JOB_STATUS_QUEUED))
            .col_expr(sync_job::Column::StartedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(sync_job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sync_job::Column::Status.eq(JOB_STATUS_RUNNING))
            .filter(sync_job::Column::StartedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected > 0 {
            warn!(
                reclaimed = result.rows_affected,
                "Requeued jobs abandoned past the visibility timeout"
            );
            counter!("sync_jobs_reclaimed_total").increment(result.rows_affected);
        }

        Ok(result.rows_affected)
    }

    /// Claim due jobs and execute them on the bounded worker pool.
    #[instrument(skip_all, fields(batch_size = self.config.claim_batch))]
    pub async fn claim_and_run_jobs(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<usize, DispatchError> {
        let jobs = self.claim_jobs().await?;
        let count = jobs.len();

        if jobs.is_empty() {
            return Ok(0);
        }

        debug!("Claimed {} jobs for execution", count);

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.concurrency));
        let mut handles = Vec::with_capacity(count);

        for job in jobs {
            let dispatcher = self.clone();
            let cancel = shutdown.clone();
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let handle = tokio::spawn(async move {
                let _permit = permit; // Holds the permit until the job completes
                if let Err(err) = dispatcher.run_single_job(job, &cancel).await {
                    error!(error = ?err, "Error running sync job");
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(count)
    }

    /// Atomically claim due jobs, excluding repositories that already have a
    /// running job.
    async fn claim_jobs(&self) -> Result<Vec<sync_job::Model>, DispatchError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let eligible_jobs = SyncJob::find()
            .select_only()
            .column(sync_job::Column::Id)
            .filter(
                sync_job::Column::Status
                    .eq(JOB_STATUS_QUEUED)
                    .and(sync_job::Column::ScheduledAt.lte(now))
                    .and(
                        sync_job::Column::RetryAfter
                            .is_null()
                            .or(sync_job::Column::RetryAfter.lte(now)),
                    ),
            )
            .filter(
                sync_job::Column::RepositoryId.not_in_subquery(
                    SyncJob::find()
                        .select_only()
                        .column(sync_job::Column::RepositoryId)
                        .filter(sync_job::Column::Status.eq(JOB_STATUS_RUNNING))
                        .into_query(),
                ),
            )
            .order_by_asc(sync_job::Column::ScheduledAt)
            .limit(Some(self.config.claim_batch as u64))
            .into_tuple::<Uuid>()
            .all(&txn)
            .await?;

        if eligible_jobs.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        // Flip the batch to running in a single statement; the status
        // re-check keeps a concurrently claimed row out of this batch.
        let update_result = SyncJob::update_many()
            .col_expr(sync_job::Column::Status, Expr::value(JOB_STATUS_RUNNING))
            .col_expr(sync_job::Column::StartedAt, Expr::value(now))
            .col_expr(
                sync_job::Column::Attempts,
                Expr::value(Expr::col(sync_job::Column::Attempts).add(1)),
            )
            .col_expr(sync_job::Column::UpdatedAt, Expr::value(now))
            .filter(sync_job::Column::Id.is_in(eligible_jobs))
            .filter(sync_job::Column::Status.eq(JOB_STATUS_QUEUED))
            .exec(&txn)
            .await?;

        let claimed_jobs = if update_result.rows_affected > 0 {
            SyncJob::find()
                .filter(sync_job::Column::Status.eq(JOB_STATUS_RUNNING))
                .filter(sync_job::Column::StartedAt.eq(now))
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;
        Ok(claimed_jobs)
    }

    /// Run a single claimed sync job end to end.
    #[instrument(skip_all, fields(job_id = %job.id, repository_id = %job.repository_id, attempt = job.attempts))]
    pub async fn run_single_job(
        &self,
        job: sync_job::Model,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let Some(repository) = self.directory.get_by_id(job.repository_id).await? else {
            // Cascade deletes make this unreachable in practice; close the
            // job out rather than leaving it running forever.
            warn!(job_id = %job.id, "Claimed job references a missing repository row");
            self.complete_job(
                &job,
                JOB_STATUS_FAILED,
                Some(serde_json::json!({
                    "type": "permanent",
                    "message": "repository row missing",
                })),
            )
            .await?;
            return Ok(());
        };

        let started = Instant::now();
        debug!(
            remote_id = repository.remote_id,
            name = %repository.name,
            "Starting sync job"
        );

        let result = self.operator.sync(&repository, cancel).await;
        histogram!("sync_job_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => self.handle_success(&job, &repository, outcome).await,
            Err(_) if cancel.is_cancelled() => self.handle_shutdown(&job).await,
            Err(err) => self.handle_failure(&job, &repository, err).await,
        }
    }

    /// Successful sync: close the job and fold the outcome into the directory.
    async fn handle_success(
        &self,
        job: &sync_job::Model,
        repository: &repository::Model,
        outcome: SyncOutcome,
    ) -> Result<(), DispatchError> {
        self.complete_job(job, JOB_STATUS_SUCCEEDED, None).await?;

        self.directory
            .record_outcome(
                repository.remote_id,
                RecordedOutcome::Success {
                    new_ref: outcome.remote_ref.clone(),
                },
            )
            .await?;

        counter!("sync_jobs_succeeded_total").increment(1);
        info!(
            remote_id = repository.remote_id,
            name = %repository.name,
            action = outcome.action.as_str(),
            new_ref = outcome.remote_ref.as_deref().unwrap_or(""),
            attempt = job.attempts,
            "Mirror synchronized"
        );

        Ok(())
    }

    /// A sync interrupted by shutdown goes straight back to the queue with
    /// the attempt uncounted; nothing was completed and nothing failed.
    async fn handle_shutdown(&self, job: &sync_job::Model) -> Result<(), DispatchError> {
        let now = Utc::now();
        let mut active: sync_job::ActiveModel = job.clone().into();
        active.status = Set(JOB_STATUS_QUEUED.to_string());
        active.attempts = Set(job.attempts.saturating_sub(1));
        active.started_at = Set(None);
        active.updated_at = Set(now.into());
        active.update(self.db.as_ref()).await?;

        info!(job_id = %job.id, "Sync interrupted by shutdown; job returned to queue");
        Ok(())
    }

    /// Failed sync: pick the policy for the error class.
    async fn handle_failure(
        &self,
        job: &sync_job::Model,
        repository: &repository::Model,
        err: MirrorError,
    ) -> Result<(), DispatchError> {
        match err.kind {
            MirrorErrorKind::Auth => {
                // Requires operator intervention; retrying cannot help.
                error!(
                    remote_id = repository.remote_id,
                    name = %repository.name,
                    error = %err,
                    "Mirror sync rejected by remote credentials"
                );
                self.fail_job(job, repository, &err).await
            }
            MirrorErrorKind::Gone => {
                info!(
                    remote_id = repository.remote_id,
                    name = %repository.name,
                    "Remote repository gone; deactivating"
                );
                self.complete_job(job, JOB_STATUS_FAILED, Some(error_payload(&err, job.attempts)))
                    .await?;
                self.directory.deactivate(repository.remote_id).await?;
                counter!("sync_jobs_gone_total").increment(1);
                Ok(())
            }
            MirrorErrorKind::Transient | MirrorErrorKind::Storage => {
                if err.kind == MirrorErrorKind::Storage {
                    error!(
                        remote_id = repository.remote_id,
                        name = %repository.name,
                        error = %err,
                        "Mirror storage failure"
                    );
                }

                if job.attempts >= self.config.max_attempts as i32 {
                    warn!(
                        remote_id = repository.remote_id,
                        name = %repository.name,
                        attempts = job.attempts,
                        error = %err,
                        "Retry budget exhausted; marking sync failed"
                    );
                    self.fail_job(job, repository, &err).await
                } else {
                    self.requeue_with_backoff(job, repository, &err).await
                }
            }
        }
    }

    /// Terminal failure: close the job and record the failure.
    async fn fail_job(
        &self,
        job: &sync_job::Model,
        repository: &repository::Model,
        err: &MirrorError,
    ) -> Result<(), DispatchError> {
        self.complete_job(job, JOB_STATUS_FAILED, Some(error_payload(err, job.attempts)))
            .await?;
        self.directory
            .record_outcome(repository.remote_id, RecordedOutcome::Failure)
            .await?;
        counter!("sync_jobs_failed_total").increment(1);
        Ok(())
    }

    /// Put a retryable failure back on the queue with backoff applied.
    async fn requeue_with_backoff(
        &self,
        job: &sync_job::Model,
        repository: &repository::Model,
        err: &MirrorError,
    ) -> Result<(), DispatchError> {
        let prior_failures = job.attempts.saturating_sub(1).max(0);
        let backoff_seconds =
            compute_backoff_seconds(&self.config, prior_failures as u32, &mut thread_rng());
        let now = Utc::now();
        let retry_after = now + chrono::Duration::seconds(backoff_seconds as i64);

        let mut active: sync_job::ActiveModel = job.clone().into();
        active.status = Set(JOB_STATUS_QUEUED.to_string());
        active.retry_after = Set(Some(retry_after.into()));
        active.started_at = Set(None);
        active.error = Set(Some(error_payload(err, job.attempts)));
        active.updated_at = Set(now.into());
        active.update(self.db.as_ref()).await?;

        counter!("sync_jobs_retried_total").increment(1);
        warn!(
            remote_id = repository.remote_id,
            name = %repository.name,
            attempt = job.attempts,
            backoff_seconds = backoff_seconds,
            error = %err,
            "Sync failed; retrying after backoff"
        );

        Ok(())
    }

    /// Move a job to a terminal status.
    async fn complete_job(
        &self,
        job: &sync_job::Model,
        status: &str,
        error: Option<serde_json::Value>,
    ) -> Result<(), DispatchError> {
        let now = Utc::now();
        let mut active: sync_job::ActiveModel = job.clone().into();
        active.status = Set(status.to_string());
        active.finished_at = Set(Some(now.into()));
        if error.is_some() {
            active.error = Set(error);
        }
        active.updated_at = Set(now.into());
        active.update(self.db.as_ref()).await?;
        Ok(())
    }
}

/// Structured error payload stored on the job row.
fn error_payload(err: &MirrorError, attempts: i32) -> serde_json::Value {
    let mut payload = serde_json::to_value(err).unwrap_or_else(|_| {
        serde_json::json!({ "type": "transient", "message": err.to_string() })
    });
    if let Some(map) = payload.as_object_mut() {
        map.insert("attempts".to_string(), serde_json::json!(attempts));
        map.insert(
            "timestamp".to_string(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    payload
}

/// Exponential backoff with cap and jitter: `base * 2^failures`, capped,
/// plus a random fraction of the capped value.
fn compute_backoff_seconds<R: Rng + ?Sized>(
    config: &DispatcherConfig,
    prior_failures: u32,
    rng: &mut R,
) -> f64 {
    let base = config.backoff_base_seconds as f64;
    let max = config.backoff_max_seconds as f64;
    let backoff = (base * 2_f64.powi(prior_failures as i32)).min(max);

    let jitter = if config.jitter_factor > 0.0 && backoff > 0.0 {
        rng.gen_range(0.0..(config.jitter_factor * backoff))
    } else {
        0.0
    };

    backoff + jitter
}
