//! Sync cycle scheduler
//!
//! Fixed-interval coordinator over the discovery client, the repository
//! directory, and the job dispatcher. The scheduler is a two-state machine:
//! `Idle` and `CycleRunning`, held in an atomic flag. A timer tick or manual
//! trigger that arrives while a cycle is still running is skipped and
//! logged, so cycles never overlap. Cycles execute on their own task and
//! never block the timer loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::discovery::{DiscoveryError, DiscoverySource};
use crate::dispatcher::{DispatchError, Dispatcher, EnqueueResult};
use crate::repositories::{DirectoryError, RepositoryDirectory};

/// Errors that abort one sync cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Counts of what one completed cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub discovered: u64,
    pub created: u64,
    pub reactivated: u64,
    pub deactivated: u64,
    pub enqueued: u64,
    pub deduplicated: u64,
    pub enqueue_errors: u64,
}

/// Result of asking for a cycle while honoring the overlap guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleStats),
    /// The previous cycle was still running; this request was dropped.
    Skipped,
}

/// Handle for requesting an immediate sync cycle (the "sync now" trigger).
#[derive(Clone)]
pub struct SchedulerHandle {
    trigger: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Request an immediate cycle. Returns false when a trigger is already
    /// pending; the pending one covers this request.
    pub fn trigger_sync(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }
}

/// The clonable cycle body handed to spawned cycle tasks.
#[derive(Clone)]
struct CycleRunner {
    discovery: Arc<dyn DiscoverySource>,
    directory: RepositoryDirectory,
    dispatcher: Dispatcher,
    cycle_running: Arc<AtomicBool>,
}

impl CycleRunner {
    /// Run one guarded cycle: discovery, reconcile, enqueue.
    async fn run_cycle(&self, reason: &'static str) -> Result<CycleOutcome, CycleError> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(reason, "Sync cycle still running; skipping this trigger");
            counter!("scheduler_cycles_skipped_total").increment(1);
            return Ok(CycleOutcome::Skipped);
        }

        // Return to Idle on every exit path, panics included.
        let _idle = scopeguard::guard(self.cycle_running.clone(), |flag| {
            flag.store(false, Ordering::Release);
        });

        let started = Instant::now();
        let stats = self.cycle_body().await?;
        let elapsed = started.elapsed();

        histogram!("scheduler_cycle_duration_ms").record(elapsed.as_secs_f64() * 1_000.0);
        info!(
            reason,
            discovered = stats.discovered,
            created = stats.created,
            reactivated = stats.reactivated,
            deactivated = stats.deactivated,
            enqueued = stats.enqueued,
            deduplicated = stats.deduplicated,
            enqueue_errors = stats.enqueue_errors,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sync cycle completed"
        );

        Ok(CycleOutcome::Completed(stats))
    }

    /// Discovery, reconcile, then one enqueue per active repository.
    ///
    /// Discovery failure aborts before the directory is touched. Enqueue
    /// failures are per-repository: they are counted and logged without
    /// aborting the rest of the cycle.
    async fn cycle_body(&self) -> Result<CycleStats, CycleError> {
        let descriptors = self.discovery.list_repositories().await?;
        let summary = self.directory.reconcile(&descriptors).await?;

        let mut stats = CycleStats {
            discovered: descriptors.len() as u64,
            created: summary.created,
            reactivated: summary.reactivated,
            deactivated: summary.deactivated,
            ..CycleStats::default()
        };

        for repository in self.directory.list_active().await? {
            match self.dispatcher.enqueue(repository.id).await {
                Ok(EnqueueResult::Enqueued) => stats.enqueued += 1,
                Ok(EnqueueResult::Deduplicated) => stats.deduplicated += 1,
                Err(err) => {
                    stats.enqueue_errors += 1;
                    error!(
                        remote_id = repository.remote_id,
                        name = %repository.name,
                        error = ?err,
                        "Failed to enqueue sync job"
                    );
                }
            }
        }

        Ok(stats)
    }
}

/// Background scheduler service.
pub struct Scheduler {
    runner: CycleRunner,
    config: SchedulerConfig,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl Scheduler {
    /// Create a new scheduler instance.
    pub fn new(
        discovery: Arc<dyn DiscoverySource>,
        directory: RepositoryDirectory,
        dispatcher: Dispatcher,
        config: SchedulerConfig,
    ) -> Self {
        // Capacity one: a pending manual trigger absorbs further requests.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            runner: CycleRunner {
                discovery,
                directory,
                dispatcher,
                cycle_running: Arc::new(AtomicBool::new(false)),
            },
            config,
            trigger_tx,
            trigger_rx,
        }
    }

    /// Handle used by the status API for the manual "sync now" trigger.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            trigger: self.trigger_tx.clone(),
        }
    }

    /// Run one guarded cycle inline. Exposed for the CLI and for tests;
    /// honors the same overlap guard as the timer loop.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        self.runner.run_cycle("inline").await
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.config.sync_interval_seconds,
            "Starting sync scheduler"
        );
        let interval = Duration::from_secs(self.config.sync_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    self.spawn_cycle("interval");
                }
                Some(()) = self.trigger_rx.recv() => {
                    self.spawn_cycle("manual");
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Launch a cycle on its own task so the timer keeps ticking; the
    /// overlap guard inside the runner drops the request when a cycle is
    /// already in flight.
    fn spawn_cycle(&self, reason: &'static str) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            match runner.run_cycle(reason).await {
                Ok(_) => {}
                Err(err) => {
                    error!(reason, error = %err, "Sync cycle failed");
                    counter!("scheduler_cycles_failed_total").increment(1);
                }
            }
        });
    }
}
