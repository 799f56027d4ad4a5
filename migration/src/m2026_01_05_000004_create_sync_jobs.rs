//! Creates the sync_jobs table and the in-flight dedupe guard.
//!
//! Only one job per `dedupe_key` may be `waiting` or `active` at a time; the
//! partial unique index enforces that for every writer, not just the scheduler.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::Kind).text().not_null())
                    .col(ColumnDef::new(SyncJobs::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::State)
                            .text()
                            .not_null()
                            .default("waiting"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::BackoffBaseMs)
                            .big_integer()
                            .not_null()
                            .default(2000),
                    )
                    .col(ColumnDef::new(SyncJobs::DedupeKey).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::RunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::LastError).json_binary().null())
                    .col(ColumnDef::new(SyncJobs::Result).json_binary().null())
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_state_run_at")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::State)
                    .col(SyncJobs::RunAt)
                    .to_owned(),
            )
            .await?;

        // Partial indexes are not expressible through the index builder.
        let backend = manager.get_database_backend();
        manager
            .get_connection()
            .execute(Statement::from_string(
                backend,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_dedupe_in_flight \
                 ON sync_jobs (dedupe_key) \
                 WHERE dedupe_key IS NOT NULL AND state IN ('waiting','active')"
                    .to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_sync_jobs_dedupe_in_flight".to_string(),
            ))
            .await?;
        manager
            .drop_index(Index::drop().name("idx_sync_jobs_state_run_at").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
    Kind,
    Payload,
    State,
    AttemptCount,
    MaxAttempts,
    BackoffBaseMs,
    DedupeKey,
    RunAt,
    StartedAt,
    FinishedAt,
    LastError,
    Result,
    CreatedAt,
    UpdatedAt,
}
