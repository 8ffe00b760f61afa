//! Migration to create the repositories table.
//!
//! This migration creates the repositories table, the directory of every
//! repository known from remote discovery together with its mirror location
//! and sync state summary.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repositories::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repositories::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Repositories::RemoteId)
                            .big_integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Repositories::Name).text().not_null())
                    .col(ColumnDef::new(Repositories::CloneUrl).text().not_null())
                    .col(ColumnDef::new(Repositories::DefaultBranch).text().null())
                    .col(ColumnDef::new(Repositories::LocalPath).text().not_null())
                    .col(ColumnDef::new(Repositories::LastRef).text().null())
                    .col(
                        ColumnDef::new(Repositories::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Repositories::LastSyncStatus)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Repositories::ConsecutiveFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Repositories::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Repositories::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repositories::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for the scheduler's active-repository scan
        manager
            .create_index(
                Index::create()
                    .name("idx_repositories_active_remote_id")
                    .table(Repositories::Table)
                    .col(Repositories::Active)
                    .col(Repositories::RemoteId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repositories_active_remote_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Repositories::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repositories {
    Table,
    Id,
    RemoteId,
    Name,
    CloneUrl,
    DefaultBranch,
    LocalPath,
    LastRef,
    LastSyncAt,
    LastSyncStatus,
    ConsecutiveFailures,
    Active,
    CreatedAt,
    UpdatedAt,
}
