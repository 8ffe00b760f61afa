//! # Server Configuration
//!
//! This module wires the service together: connection pool, migrations,
//! background scheduler and dispatcher tasks, and the axum status API with
//! graceful shutdown.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::db;
use crate::discovery::{DiscoverySource, GitLabDiscovery};
use crate::dispatcher::Dispatcher;
use crate::handlers;
use crate::mirror::{GitMirror, MirrorOperator};
use crate::repositories::RepositoryDirectory;
use crate::scheduler::{Scheduler, SchedulerHandle};
use migration::{Migrator, MigratorTrait};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub directory: RepositoryDirectory,
    pub scheduler: SchedulerHandle,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/repositories", get(handlers::list_repositories))
        .route("/repositories/{remote_id}", get(handlers::get_repository))
        .route("/sync", post(handlers::trigger_sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the full service: store, background engine, and status API.
pub async fn run_server(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Store unreachable or unmigratable at startup is fatal.
    let db = Arc::new(db::init_pool(&config).await?);
    Migrator::up(db.as_ref(), None).await?;

    let directory = RepositoryDirectory::new(db.clone(), config.mirror.root.clone());
    let operator: Arc<dyn MirrorOperator> = Arc::new(GitMirror::new(config.mirror.clone()));
    let dispatcher = Dispatcher::new(
        db.clone(),
        operator,
        directory.clone(),
        config.dispatcher.clone(),
    );
    let discovery: Arc<dyn DiscoverySource> = Arc::new(GitLabDiscovery::new(config.gitlab.clone()));
    let scheduler = Scheduler::new(
        discovery,
        directory.clone(),
        dispatcher.clone(),
        config.scheduler.clone(),
    );
    let scheduler_handle = scheduler.handle();

    let shutdown = CancellationToken::new();

    let dispatcher_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let token = shutdown.clone();
        async move {
            if let Err(err) = dispatcher.run(token).await {
                error!(error = ?err, "Job dispatcher exited with error");
            }
        }
    });
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let state = AppState {
        db: db.clone(),
        directory,
        scheduler: scheduler_handle,
    };
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, profile = %config.profile, "Server listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    // Stop the background engine and wait for in-flight work to release.
    shutdown.cancel();
    let _ = scheduler_task.await;
    let _ = dispatcher_task.await;

    info!("Shutdown complete");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::list_repositories,
        crate::handlers::get_repository,
        crate::handlers::trigger_sync,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::RepositoryView,
            crate::handlers::SyncTriggered,
            crate::error::ApiError,
        )
    ),
    info(
        title = "gitmirror API",
        description = "Status and control surface for the repository mirroring service",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
