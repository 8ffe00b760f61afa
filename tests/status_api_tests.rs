//! Integration tests for the read-only status API and the manual sync
//! trigger endpoint, served over a real listener.

mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gitmirror::config::{DispatcherConfig, SchedulerConfig};
use gitmirror::discovery::{DiscoveryError, DiscoverySource, RepositoryDescriptor};
use gitmirror::dispatcher::Dispatcher;
use gitmirror::mirror::{MirrorError, MirrorOperator, SyncAction, SyncOutcome};
use gitmirror::models::repository;
use gitmirror::repositories::RecordedOutcome;
use gitmirror::scheduler::Scheduler;
use gitmirror::server::{AppState, create_app};
use test_utils::{descriptor, setup_directory};

struct EmptyDiscovery;

#[async_trait]
impl DiscoverySource for EmptyDiscovery {
    async fn list_repositories(&self) -> Result<Vec<RepositoryDescriptor>, DiscoveryError> {
        Ok(Vec::new())
    }
}

struct NoopOperator;

#[async_trait]
impl MirrorOperator for NoopOperator {
    async fn sync(
        &self,
        _repository: &repository::Model,
        _cancel: &CancellationToken,
    ) -> Result<SyncOutcome, MirrorError> {
        Ok(SyncOutcome {
            remote_ref: None,
            action: SyncAction::Fetched,
        })
    }
}

/// Serve the app on an ephemeral port and return its base URL.
async fn spawn_app() -> Result<(String, gitmirror::repositories::RepositoryDirectory)> {
    let (db, directory) = setup_directory().await?;

    let dispatcher = Dispatcher::new(
        db.clone(),
        Arc::new(NoopOperator),
        directory.clone(),
        DispatcherConfig::default(),
    );
    let scheduler = Scheduler::new(
        Arc::new(EmptyDiscovery),
        directory.clone(),
        dispatcher,
        SchedulerConfig::default(),
    );

    let state = AppState {
        db: db.clone(),
        directory: directory.clone(),
        scheduler: scheduler.handle(),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        // Keep the Scheduler alive for the lifetime of the served app so its
        // trigger-channel receiver is not dropped. The receiver is never
        // polled here, which is exactly the "nothing draining" scenario the
        // sync-folding test exercises.
        let _scheduler = scheduler;
        let _ = axum::serve(listener, app).await;
    });

    Ok((format!("http://{addr}"), directory))
}

#[tokio::test]
async fn root_reports_service_info() -> Result<()> {
    let (base, _directory) = spawn_app().await?;

    let body: serde_json::Value = reqwest::get(format!("{base}/")).await?.json().await?;
    assert_eq!(body.get("service").and_then(|v| v.as_str()), Some("gitmirror"));
    assert!(body.get("version").is_some());

    Ok(())
}

#[tokio::test]
async fn healthz_answers_ok_while_the_store_is_reachable() -> Result<()> {
    let (base, _directory) = spawn_app().await?;

    let response = reqwest::get(format!("{base}/healthz")).await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

#[tokio::test]
async fn repositories_endpoint_reports_sync_state() -> Result<()> {
    let (base, directory) = spawn_app().await?;

    directory
        .reconcile(&[descriptor(1, "group/alpha"), descriptor(2, "group/beta")])
        .await?;
    directory
        .record_outcome(1, RecordedOutcome::Success { new_ref: Some("abc123".into()) })
        .await?;

    let body: serde_json::Value = reqwest::get(format!("{base}/repositories"))
        .await?
        .json()
        .await?;
    let listing = body.as_array().expect("array response");
    assert_eq!(listing.len(), 2);
    assert_eq!(
        listing[0].get("last_sync_status").and_then(|v| v.as_str()),
        Some("success")
    );
    assert_eq!(
        listing[1].get("last_sync_status").and_then(|v| v.as_str()),
        Some("pending")
    );

    let alpha: serde_json::Value = reqwest::get(format!("{base}/repositories/1"))
        .await?
        .json()
        .await?;
    assert_eq!(alpha.get("name").and_then(|v| v.as_str()), Some("group/alpha"));
    assert_eq!(alpha.get("last_ref").and_then(|v| v.as_str()), Some("abc123"));

    Ok(())
}

#[tokio::test]
async fn unknown_repository_is_a_problem_json_404() -> Result<()> {
    let (base, _directory) = spawn_app().await?;

    let response = reqwest::get(format!("{base}/repositories/999")).await?;
    assert_eq!(response.status(), 404);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/problem+json")
    );
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body.get("code").and_then(|v| v.as_str()), Some("NOT_FOUND"));

    Ok(())
}

#[tokio::test]
async fn sync_trigger_is_accepted_and_folds_duplicates() -> Result<()> {
    let (base, _directory) = spawn_app().await?;
    let client = reqwest::Client::new();

    // Nothing is draining the trigger channel in this test, so the first
    // request wins and the second folds into it.
    let first = client.post(format!("{base}/sync")).send().await?;
    assert_eq!(first.status(), 202);
    let body: serde_json::Value = first.json().await?;
    assert_eq!(body.get("triggered").and_then(|v| v.as_bool()), Some(true));

    let second = client.post(format!("{base}/sync")).send().await?;
    assert_eq!(second.status(), 202);
    let body: serde_json::Value = second.json().await?;
    assert_eq!(body.get("triggered").and_then(|v| v.as_bool()), Some(false));

    Ok(())
}
