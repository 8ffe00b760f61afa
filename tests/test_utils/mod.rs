//! Test utilities for database testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations for testing purposes, plus fixture helpers for the
//! repository directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};

use gitmirror::discovery::RepositoryDescriptor;
use gitmirror::models::repository;
use gitmirror::repositories::RepositoryDirectory;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(db))
}

/// Directory rooted at a throwaway mirror path over a fresh database.
pub async fn setup_directory() -> Result<(Arc<DatabaseConnection>, RepositoryDirectory)> {
    let db = setup_test_db().await?;
    let directory = RepositoryDirectory::new(db.clone(), PathBuf::from("/tmp/gitmirror-tests"));
    Ok((db, directory))
}

/// Minimal descriptor fixture.
#[allow(dead_code)]
pub fn descriptor(remote_id: i64, name: &str) -> RepositoryDescriptor {
    RepositoryDescriptor {
        remote_id,
        name: name.to_string(),
        clone_url: format!("https://gitlab.example.com/{name}.git"),
        default_branch: Some("main".to_string()),
    }
}

/// Reconcile a single descriptor in and return the created row.
#[allow(dead_code)]
pub async fn reconcile_one(
    directory: &RepositoryDirectory,
    remote_id: i64,
    name: &str,
) -> Result<repository::Model> {
    directory.reconcile(&[descriptor(remote_id, name)]).await?;
    directory
        .get(remote_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("repository {remote_id} not created"))
}
