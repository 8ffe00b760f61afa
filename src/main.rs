//! # gitmirror Main Entry Point
//!
//! Command-line entry point for the gitmirror service: run the full
//! service, apply migrations, or list known repositories.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};

use gitmirror::{
    config::{AppConfig, ConfigLoader},
    db, repositories, server, telemetry,
};

#[derive(Parser)]
#[command(name = "gitmirror", version, about = "GitLab group repository mirroring service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the mirroring service (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Print the known repositories and their sync state
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config_loader = ConfigLoader::new();
    let config = config_loader.load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(config).await,
        Command::List => list(config).await,
    }
}

async fn serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing(&config)?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    server::run_server(config).await
}

async fn migrate(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None).await?;
    println!("Migrations applied");
    Ok(())
}

async fn list(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(db::init_pool(&config).await?);
    let directory =
        repositories::RepositoryDirectory::new(db, config.mirror.root.clone());

    for repository in directory.list_all().await? {
        let last_sync = repository
            .last_sync_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>10}  {:<50}  {:<8}  failures={}  active={}  last_sync={}",
            repository.remote_id,
            repository.name,
            repository.last_sync_status,
            repository.consecutive_failures,
            repository.active,
            last_sync
        );
    }

    Ok(())
}
