//! Repository entity model
//!
//! This module contains the SeaORM entity model for the repositories table,
//! the directory record of every repository known from remote discovery.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Sync status a repository row can report.
pub const SYNC_STATUS_PENDING: &str = "pending";
pub const SYNC_STATUS_SUCCESS: &str = "success";
pub const SYNC_STATUS_FAILED: &str = "failed";

/// Repository entity representing one mirrored remote repository
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "repositories")]
pub struct Model {
    /// Unique identifier for the directory row (primary key)
    #[sea_orm(primary_key)]
    pub id: Uuid,

    /// Stable project identifier assigned by the remote (unique)
    pub remote_id: i64,

    /// Path with namespace as reported by the remote, used for display
    pub name: String,

    /// URL the mirror operator clones and fetches from
    pub clone_url: String,

    /// Default branch advertised by the remote, if any
    pub default_branch: Option<String>,

    /// Local mirror location, derived from the remote identifier
    pub local_path: String,

    /// Last-known head commit of the default branch
    pub last_ref: Option<String>,

    /// Timestamp of the last completed sync attempt
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// Outcome summary of the last sync attempt (pending|success|failed)
    pub last_sync_status: String,

    /// Failures since the last successful sync
    pub consecutive_failures: i32,

    /// False once the remote stops reporting the repository (soft delete)
    pub active: bool,

    /// Timestamp when the repository was first discovered
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the row was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
