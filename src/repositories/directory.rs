//! Repository directory for database operations
//!
//! The directory is the durable record of every repository known from
//! discovery and the single source of truth for sync state. Identity
//! originates exclusively from [`RepositoryDirectory::reconcile`]; outcome
//! recording for an unreconciled identifier is rejected, never inserted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::RepositoryDescriptor;
use crate::models::repository::{
    self, Entity as Repository, SYNC_STATUS_FAILED, SYNC_STATUS_PENDING, SYNC_STATUS_SUCCESS,
};

/// Errors produced by directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Outcome recording referenced an identifier never seen by reconcile.
    #[error("unknown repository {remote_id}; identity must originate from reconcile")]
    UnknownRepository { remote_id: i64 },
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

/// Counts of the changes one reconcile pass applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: u64,
    pub reactivated: u64,
    pub deactivated: u64,
}

impl ReconcileSummary {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.reactivated == 0 && self.deactivated == 0
    }
}

/// Completed sync attempt result to fold into a repository's summary fields.
#[derive(Debug, Clone)]
pub enum RecordedOutcome {
    Success { new_ref: Option<String> },
    Failure,
}

/// Derive the mirror location for a remote identifier.
///
/// The path depends only on the identifier so it survives renames and is
/// never reused across different identifiers.
pub fn local_path_for(mirror_root: &Path, remote_id: i64) -> PathBuf {
    mirror_root.join(format!("{remote_id}.git"))
}

/// Directory of known repositories and their sync state.
#[derive(Debug, Clone)]
pub struct RepositoryDirectory {
    db: Arc<DatabaseConnection>,
    mirror_root: PathBuf,
}

impl RepositoryDirectory {
    /// Creates a new directory over the given connection pool.
    pub fn new(db: Arc<DatabaseConnection>, mirror_root: PathBuf) -> Self {
        Self { db, mirror_root }
    }

    /// Bring the record set into agreement with the latest discovery result.
    ///
    /// Upserts by remote identifier inside one transaction: newly seen
    /// descriptors are inserted with a pending status and a derived mirror
    /// path, returning descriptors reactivate their soft-deleted rows, and
    /// rows absent from the list flip inactive. Reconciling the identical
    /// list twice is a no-op the second time.
    pub async fn reconcile(
        &self,
        descriptors: &[RepositoryDescriptor],
    ) -> Result<ReconcileSummary, DirectoryError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();
        let mut summary = ReconcileSummary::default();

        let existing: HashMap<i64, repository::Model> = Repository::find()
            .all(&txn)
            .await?
            .into_iter()
            .map(|model| (model.remote_id, model))
            .collect();

        let mut seen: HashSet<i64> = HashSet::with_capacity(descriptors.len());

        for descriptor in descriptors {
            if !seen.insert(descriptor.remote_id) {
                // The remote should not repeat identifiers within one listing.
                warn!(
                    remote_id = descriptor.remote_id,
                    name = %descriptor.name,
                    "Duplicate descriptor in discovery result; ignoring repeat"
                );
                continue;
            }

            match existing.get(&descriptor.remote_id) {
                None => {
                    let local_path = local_path_for(&self.mirror_root, descriptor.remote_id);
                    let model = repository::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        remote_id: Set(descriptor.remote_id),
                        name: Set(descriptor.name.clone()),
                        clone_url: Set(descriptor.clone_url.clone()),
                        default_branch: Set(descriptor.default_branch.clone()),
                        local_path: Set(local_path.to_string_lossy().into_owned()),
                        last_ref: Set(None),
                        last_sync_at: Set(None),
                        last_sync_status: Set(SYNC_STATUS_PENDING.to_string()),
                        consecutive_failures: Set(0),
                        active: Set(true),
                        created_at: Set(now.into()),
                        updated_at: Set(now.into()),
                    };
                    // SQLite cannot unpack a uuid last-insert id; the row is
                    // still written.
                    match model.insert(&txn).await {
                        Ok(_) | Err(DbErr::UnpackInsertId) => {}
                        Err(err) => return Err(err.into()),
                    }
                    summary.created += 1;
                    info!(
                        remote_id = descriptor.remote_id,
                        name = %descriptor.name,
                        "Discovered new repository"
                    );
                }
                Some(current) => {
                    let reactivating = !current.active;
                    let metadata_changed = current.name != descriptor.name
                        || current.clone_url != descriptor.clone_url
                        || current.default_branch != descriptor.default_branch;

                    if reactivating || metadata_changed {
                        let mut active: repository::ActiveModel = current.clone().into();
                        active.name = Set(descriptor.name.clone());
                        active.clone_url = Set(descriptor.clone_url.clone());
                        active.default_branch = Set(descriptor.default_branch.clone());
                        active.active = Set(true);
                        active.updated_at = Set(now.into());
                        active.update(&txn).await?;
                    }

                    if reactivating {
                        summary.reactivated += 1;
                        info!(
                            remote_id = descriptor.remote_id,
                            name = %descriptor.name,
                            "Repository reappeared upstream; reactivated"
                        );
                    }
                }
            }
        }

        for (remote_id, model) in &existing {
            if model.active && !seen.contains(remote_id) {
                let mut active: repository::ActiveModel = model.clone().into();
                active.active = Set(false);
                active.updated_at = Set(now.into());
                active.update(&txn).await?;
                summary.deactivated += 1;
                info!(
                    remote_id = model.remote_id,
                    name = %model.name,
                    "Repository no longer reported upstream; deactivated"
                );
            }
        }

        txn.commit().await?;

        debug!(
            created = summary.created,
            reactivated = summary.reactivated,
            deactivated = summary.deactivated,
            "Reconcile completed"
        );

        Ok(summary)
    }

    /// Atomically fold a completed sync attempt into the repository summary.
    ///
    /// Success resets the failure counter and records the new remote
    /// reference; failure increments the counter. An unknown identifier is
    /// rejected with [`DirectoryError::UnknownRepository`].
    pub async fn record_outcome(
        &self,
        remote_id: i64,
        outcome: RecordedOutcome,
    ) -> Result<(), DirectoryError> {
        let Some(current) = self.get(remote_id).await? else {
            warn!(
                remote_id,
                "Refusing to record outcome for unknown repository"
            );
            return Err(DirectoryError::UnknownRepository { remote_id });
        };

        let now = Utc::now();
        let mut active: repository::ActiveModel = current.clone().into();
        active.last_sync_at = Set(Some(now.into()));
        active.updated_at = Set(now.into());

        match outcome {
            RecordedOutcome::Success { new_ref } => {
                active.last_sync_status = Set(SYNC_STATUS_SUCCESS.to_string());
                active.consecutive_failures = Set(0);
                if new_ref.is_some() {
                    active.last_ref = Set(new_ref);
                }
            }
            RecordedOutcome::Failure => {
                active.last_sync_status = Set(SYNC_STATUS_FAILED.to_string());
                active.consecutive_failures = Set(current.consecutive_failures.saturating_add(1));
            }
        }

        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    /// Mark a repository inactive without touching its failure accounting.
    ///
    /// Used when the mirror operator reports the remote repository gone;
    /// disappearance is lifecycle, not failure.
    pub async fn deactivate(&self, remote_id: i64) -> Result<(), DirectoryError> {
        let Some(current) = self.get(remote_id).await? else {
            warn!(remote_id, "Refusing to deactivate unknown repository");
            return Err(DirectoryError::UnknownRepository { remote_id });
        };

        if !current.active {
            return Ok(());
        }

        let mut active: repository::ActiveModel = current.into();
        active.active = Set(false);
        active.updated_at = Set(Utc::now().into());
        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    /// Active repositories ordered by remote identifier; the scheduler's job set.
    pub async fn list_active(&self) -> Result<Vec<repository::Model>, DirectoryError> {
        Ok(Repository::find()
            .filter(repository::Column::Active.eq(true))
            .order_by_asc(repository::Column::RemoteId)
            .all(self.db.as_ref())
            .await?)
    }

    /// Every known repository, active or not, for reporting surfaces.
    pub async fn list_all(&self) -> Result<Vec<repository::Model>, DirectoryError> {
        Ok(Repository::find()
            .order_by_asc(repository::Column::RemoteId)
            .all(self.db.as_ref())
            .await?)
    }

    /// Look up one repository by its remote identifier.
    pub async fn get(&self, remote_id: i64) -> Result<Option<repository::Model>, DirectoryError> {
        Ok(Repository::find()
            .filter(repository::Column::RemoteId.eq(remote_id))
            .one(self.db.as_ref())
            .await?)
    }

    /// Look up one repository by its directory row id.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<repository::Model>, DirectoryError> {
        Ok(Repository::find_by_id(id).one(self.db.as_ref()).await?)
    }
}
