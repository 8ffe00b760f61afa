//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table,
//! the dispatcher's durable queue of mirror synchronization work.

use super::repository::Entity as Repository;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Job lifecycle states. A partial unique index on the repository keeps at
/// most one row in `queued` or `running` per repository.
pub const JOB_STATUS_QUEUED: &str = "queued";
pub const JOB_STATUS_RUNNING: &str = "running";
pub const JOB_STATUS_SUCCEEDED: &str = "succeeded";
pub const JOB_STATUS_FAILED: &str = "failed";

/// SyncJob entity representing one scheduled mirror synchronization
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key)]
    pub id: Uuid,

    /// Repository this job synchronizes; doubles as the idempotency key
    pub repository_id: Uuid,

    /// Current status of the job (queued, running, succeeded, failed)
    pub status: String,

    /// Number of attempts made for this job, incremented at claim time
    pub attempts: i32,

    /// Timestamp when the job becomes due
    pub scheduled_at: DateTimeWithTimeZone,

    /// Timestamp when the job becomes eligible again after backoff
    pub retry_after: Option<DateTimeWithTimeZone>,

    /// Timestamp when the current attempt started execution
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached a terminal status
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Structured error details of the last failed attempt
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    /// Timestamp when the sync job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the sync job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Repository",
        from = "Column::RepositoryId",
        to = "super::repository::Column::Id"
    )]
    Repository,
}

impl Related<Repository> for Entity {
    fn to() -> RelationDef {
        Relation::Repository.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
