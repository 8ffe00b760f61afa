//! Database migrations for the gitmirror service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_12_000001_create_repositories;
mod m2026_01_12_000002_create_sync_jobs;
mod m2026_01_20_000100_add_sync_job_pending_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_12_000001_create_repositories::Migration),
            Box::new(m2026_01_12_000002_create_sync_jobs::Migration),
            Box::new(m2026_01_20_000100_add_sync_job_pending_guard::Migration),
        ]
    }
}
