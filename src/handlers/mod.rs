//! # API Handlers
//!
//! This module contains the HTTP endpoint handlers for the gitmirror status
//! API: a read-only view over the repository directory plus the manual sync
//! trigger.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db;
use crate::error::{ApiError, ErrorType};
use crate::models::ServiceInfo;
use crate::models::repository;
use crate::server::AppState;

/// Read-only view of one repository's directory row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RepositoryView {
    /// Stable identifier assigned by the remote
    pub remote_id: i64,
    /// Path with namespace
    pub name: String,
    /// URL the mirror is synchronized from
    pub clone_url: String,
    /// Default branch advertised by the remote
    pub default_branch: Option<String>,
    /// Local mirror location
    pub local_path: String,
    /// Last-known head commit of the default branch
    pub last_ref: Option<String>,
    /// Timestamp of the last completed sync attempt
    pub last_sync_at: Option<DateTime<FixedOffset>>,
    /// Outcome of the last sync attempt (pending|success|failed)
    pub last_sync_status: String,
    /// Failures since the last successful sync
    pub consecutive_failures: i32,
    /// False once the remote stopped reporting the repository
    pub active: bool,
}

impl From<repository::Model> for RepositoryView {
    fn from(model: repository::Model) -> Self {
        Self {
            remote_id: model.remote_id,
            name: model.name,
            clone_url: model.clone_url,
            default_branch: model.default_branch,
            local_path: model.local_path,
            last_ref: model.last_ref,
            last_sync_at: model.last_sync_at,
            last_sync_status: model.last_sync_status,
            consecutive_failures: model.consecutive_failures,
            active: model.active,
        }
    }
}

/// Response of the manual sync trigger.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncTriggered {
    /// False when a trigger was already pending and this request was folded
    /// into it
    pub triggered: bool,
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness/readiness probe backed by a database round trip
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service healthy"),
        (status = 503, description = "Database unreachable", body = ApiError)
    ),
    tag = "status"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    db::health_check(&state.db)
        .await
        .map_err(|_| ApiError::from(ErrorType::ServiceUnavailable))?;
    Ok(StatusCode::OK)
}

/// List every known repository with its sync state
#[utoipa::path(
    get,
    path = "/repositories",
    responses(
        (status = 200, description = "Known repositories", body = [RepositoryView])
    ),
    tag = "status"
)]
pub async fn list_repositories(
    State(state): State<AppState>,
) -> Result<Json<Vec<RepositoryView>>, ApiError> {
    let repositories = state
        .directory
        .list_all()
        .await
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;
    Ok(Json(
        repositories.into_iter().map(RepositoryView::from).collect(),
    ))
}

/// Look up one repository by its remote identifier
#[utoipa::path(
    get,
    path = "/repositories/{remote_id}",
    params(
        ("remote_id" = i64, Path, description = "Remote repository identifier")
    ),
    responses(
        (status = 200, description = "Repository found", body = RepositoryView),
        (status = 404, description = "Unknown repository", body = ApiError)
    ),
    tag = "status"
)]
pub async fn get_repository(
    State(state): State<AppState>,
    Path(remote_id): Path<i64>,
) -> Result<Json<RepositoryView>, ApiError> {
    let repository = state
        .directory
        .get(remote_id)
        .await
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))?
        .ok_or_else(|| ApiError::from(ErrorType::NotFound))?;
    Ok(Json(repository.into()))
}

/// Request an immediate sync cycle
#[utoipa::path(
    post,
    path = "/sync",
    responses(
        (status = 202, description = "Sync cycle requested", body = SyncTriggered)
    ),
    tag = "status"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
) -> (StatusCode, Json<SyncTriggered>) {
    let triggered = state.scheduler.trigger_sync();
    (StatusCode::ACCEPTED, Json(SyncTriggered { triggered }))
}
