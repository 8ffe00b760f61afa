//! Integration tests for the job dispatcher: enqueue deduplication, the
//! single-flight guarantee, retry/backoff policy per error class, and
//! visibility-timeout reclaim.

mod test_utils;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tokio_util::sync::CancellationToken;

use gitmirror::config::DispatcherConfig;
use gitmirror::dispatcher::{Dispatcher, EnqueueResult};
use gitmirror::mirror::{MirrorError, MirrorOperator, SyncAction, SyncOutcome};
use gitmirror::models::repository;
use gitmirror::models::sync_job::{
    self, Entity as SyncJob, JOB_STATUS_FAILED, JOB_STATUS_QUEUED, JOB_STATUS_RUNNING,
    JOB_STATUS_SUCCEEDED,
};
use gitmirror::repositories::RepositoryDirectory;
use test_utils::{reconcile_one, setup_directory};

/// Operator stub that replays a scripted sequence of outcomes.
struct ScriptedOperator {
    script: tokio::sync::Mutex<VecDeque<Result<SyncOutcome, MirrorError>>>,
    calls: AtomicUsize,
}

impl ScriptedOperator {
    fn new(script: Vec<Result<SyncOutcome, MirrorError>>) -> Arc<Self> {
        Arc::new(Self {
            script: tokio::sync::Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn succeeding() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn success(head: &str) -> Result<SyncOutcome, MirrorError> {
        Ok(SyncOutcome {
            remote_ref: Some(head.to_string()),
            action: SyncAction::Fetched,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MirrorOperator for ScriptedOperator {
    async fn sync(
        &self,
        _repository: &repository::Model,
        _cancel: &CancellationToken,
    ) -> Result<SyncOutcome, MirrorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().await.pop_front().unwrap_or_else(|| {
            Ok(SyncOutcome {
                remote_ref: Some("deadbeef".to_string()),
                action: SyncAction::Fetched,
            })
        })
    }
}

fn test_config(max_attempts: u32) -> DispatcherConfig {
    DispatcherConfig {
        tick_ms: 10,
        concurrency: 4,
        claim_batch: 16,
        max_attempts,
        // Immediate retries keep the tests fast and deterministic.
        backoff_base_seconds: 0,
        backoff_max_seconds: 0,
        jitter_factor: 0.0,
        visibility_timeout_seconds: 3600,
    }
}

async fn setup_dispatcher(
    operator: Arc<ScriptedOperator>,
    max_attempts: u32,
) -> Result<(
    Arc<DatabaseConnection>,
    RepositoryDirectory,
    Dispatcher,
    Arc<ScriptedOperator>,
)> {
    let (db, directory) = setup_directory().await?;
    let dispatcher = Dispatcher::new(
        db.clone(),
        operator.clone(),
        directory.clone(),
        test_config(max_attempts),
    );
    Ok((db, directory, dispatcher, operator))
}

async fn jobs_for(db: &DatabaseConnection, repository_id: uuid::Uuid) -> Result<Vec<sync_job::Model>> {
    Ok(SyncJob::find()
        .filter(sync_job::Column::RepositoryId.eq(repository_id))
        .all(db)
        .await?)
}

#[tokio::test]
async fn enqueue_twice_before_execution_runs_exactly_once() -> Result<()> {
    let (db, directory, dispatcher, operator) =
        setup_dispatcher(ScriptedOperator::succeeding(), 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;

    assert_eq!(dispatcher.enqueue(repo.id).await?, EnqueueResult::Enqueued);
    assert_eq!(
        dispatcher.enqueue(repo.id).await?,
        EnqueueResult::Deduplicated
    );

    let executed = dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    assert_eq!(executed, 1);
    assert_eq!(operator.calls(), 1);

    let jobs = jobs_for(db.as_ref(), repo.id).await?;
    assert_eq!(jobs.len(), 1, "dedup must not create a second job row");
    assert_eq!(jobs[0].status, JOB_STATUS_SUCCEEDED);

    Ok(())
}

#[tokio::test]
async fn enqueue_storm_on_one_repository_keeps_a_single_pending_job() -> Result<()> {
    let (db, directory, dispatcher, _operator) =
        setup_dispatcher(ScriptedOperator::succeeding(), 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let dispatcher = dispatcher.clone();
        let repo_id = repo.id;
        handles.push(tokio::spawn(async move { dispatcher.enqueue(repo_id).await }));
    }

    let mut enqueued = 0;
    for handle in handles {
        if matches!(handle.await?, Ok(EnqueueResult::Enqueued)) {
            enqueued += 1;
        }
    }

    assert_eq!(enqueued, 1, "exactly one storm enqueue may win");
    assert_eq!(jobs_for(db.as_ref(), repo.id).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn enqueue_is_deduplicated_while_a_job_is_running() -> Result<()> {
    let (db, directory, dispatcher, _operator) =
        setup_dispatcher(ScriptedOperator::succeeding(), 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;

    dispatcher.enqueue(repo.id).await?;
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    let mut active: sync_job::ActiveModel = job.into();
    active.status = Set(JOB_STATUS_RUNNING.to_string());
    active.started_at = Set(Some(Utc::now().into()));
    active.update(db.as_ref()).await?;

    assert_eq!(
        dispatcher.enqueue(repo.id).await?,
        EnqueueResult::Deduplicated
    );

    // A running repository is also excluded from claiming.
    let executed = dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    assert_eq!(executed, 0);

    Ok(())
}

#[tokio::test]
async fn transient_failures_retry_then_succeed_within_budget() -> Result<()> {
    let operator = ScriptedOperator::new(vec![
        Err(MirrorError::transient("connection reset")),
        Err(MirrorError::transient("connection reset")),
        ScriptedOperator::success("abc123"),
    ]);
    let (db, directory, dispatcher, operator) = setup_dispatcher(operator, 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    // Attempt 1: fails, requeued.
    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_QUEUED);
    assert_eq!(job.attempts, 1);
    assert!(job.retry_after.is_some());
    assert!(job.error.is_some());

    // Attempt 2: fails, requeued.
    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.attempts, 2);

    // Attempt 3: succeeds.
    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_SUCCEEDED);
    assert_eq!(job.attempts, 3);
    assert_eq!(operator.calls(), 3);

    let row = directory.get(1).await?.unwrap();
    assert_eq!(row.last_sync_status, "success");
    assert_eq!(row.consecutive_failures, 0);
    assert_eq!(row.last_ref.as_deref(), Some("abc123"));

    Ok(())
}

#[tokio::test]
async fn exhausted_retries_mark_the_job_and_repository_failed() -> Result<()> {
    let operator = ScriptedOperator::new(vec![
        Err(MirrorError::transient("timeout")),
        Err(MirrorError::transient("timeout")),
        Err(MirrorError::transient("timeout")),
    ]);
    let (db, directory, dispatcher, operator) = setup_dispatcher(operator, 2).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;

    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_FAILED);
    assert_eq!(job.attempts, 2);
    assert!(job.finished_at.is_some());
    assert_eq!(operator.calls(), 2);

    // Terminal: nothing left to claim until the next cycle enqueues anew.
    let executed = dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    assert_eq!(executed, 0);
    assert_eq!(operator.calls(), 2);

    let row = directory.get(1).await?.unwrap();
    assert_eq!(row.last_sync_status, "failed");
    assert_eq!(row.consecutive_failures, 1);

    Ok(())
}

#[tokio::test]
async fn auth_failures_are_not_retried() -> Result<()> {
    let operator = ScriptedOperator::new(vec![Err(MirrorError::auth("credentials rejected"))]);
    let (db, directory, dispatcher, operator) = setup_dispatcher(operator, 5).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;

    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_FAILED);
    assert_eq!(operator.calls(), 1);
    let error = job.error.expect("error payload recorded");
    assert_eq!(error.get("type").and_then(|v| v.as_str()), Some("auth"));

    let row = directory.get(1).await?.unwrap();
    assert_eq!(row.last_sync_status, "failed");
    assert_eq!(row.consecutive_failures, 1);

    Ok(())
}

#[tokio::test]
async fn gone_repositories_are_deactivated_without_failure_accounting() -> Result<()> {
    let operator = ScriptedOperator::new(vec![Err(MirrorError::gone("project removed"))]);
    let (db, directory, dispatcher, operator) = setup_dispatcher(operator, 5).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;

    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_FAILED);
    assert_eq!(operator.calls(), 1);
    let error = job.error.expect("error payload recorded");
    assert_eq!(error.get("type").and_then(|v| v.as_str()), Some("gone"));

    let row = directory.get(1).await?.unwrap();
    assert!(!row.active, "gone repository must be deactivated");
    // Disappearance is lifecycle, not failure.
    assert_eq!(row.consecutive_failures, 0);
    assert_eq!(row.last_sync_status, "pending");

    Ok(())
}

#[tokio::test]
async fn storage_failures_follow_the_transient_retry_policy() -> Result<()> {
    let operator = ScriptedOperator::new(vec![
        Err(MirrorError::storage("disk full")),
        ScriptedOperator::success("abc123"),
    ]);
    let (db, directory, dispatcher, operator) = setup_dispatcher(operator, 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_QUEUED, "storage errors are retryable");

    dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_SUCCEEDED);
    assert_eq!(operator.calls(), 2);

    Ok(())
}

#[tokio::test]
async fn stale_running_jobs_are_reclaimed_after_visibility_timeout() -> Result<()> {
    let (db, directory, dispatcher, operator) =
        setup_dispatcher(ScriptedOperator::succeeding(), 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    // Simulate a worker that claimed the job and crashed two hours ago.
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    let mut active: sync_job::ActiveModel = job.into();
    active.status = Set(JOB_STATUS_RUNNING.to_string());
    active.attempts = Set(1);
    active.started_at = Set(Some((Utc::now() - Duration::hours(2)).into()));
    active.update(db.as_ref()).await?;

    let reclaimed = dispatcher.reclaim_stale_jobs().await?;
    assert_eq!(reclaimed, 1);

    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_QUEUED);
    assert!(job.started_at.is_none());

    // And it is claimable again.
    let executed = dispatcher
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    assert_eq!(executed, 1);
    assert_eq!(operator.calls(), 1);

    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_SUCCEEDED);

    Ok(())
}

#[tokio::test]
async fn recent_running_jobs_are_not_reclaimed() -> Result<()> {
    let (db, directory, dispatcher, _operator) =
        setup_dispatcher(ScriptedOperator::succeeding(), 3).await?;
    let repo = reconcile_one(&directory, 1, "group/alpha").await?;
    dispatcher.enqueue(repo.id).await?;

    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    let mut active: sync_job::ActiveModel = job.into();
    active.status = Set(JOB_STATUS_RUNNING.to_string());
    active.started_at = Set(Some(Utc::now().into()));
    active.update(db.as_ref()).await?;

    assert_eq!(dispatcher.reclaim_stale_jobs().await?, 0);
    let job = jobs_for(db.as_ref(), repo.id).await?.remove(0);
    assert_eq!(job.status, JOB_STATUS_RUNNING);

    Ok(())
}
