//! Creates the job_schedules table holding standing recurring registrations.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobSchedules::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobSchedules::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(JobSchedules::DedupeKey)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(JobSchedules::Kind).text().not_null())
                    .col(ColumnDef::new(JobSchedules::Payload).json_binary().not_null())
                    .col(ColumnDef::new(JobSchedules::CronSpec).text().not_null())
                    .col(
                        ColumnDef::new(JobSchedules::NextRunAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobSchedules::LastEnqueuedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobSchedules::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(JobSchedules::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobSchedules::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobSchedules {
    Table,
    Id,
    DedupeKey,
    Kind,
    Payload,
    CronSpec,
    NextRunAt,
    LastEnqueuedAt,
    CreatedAt,
    UpdatedAt,
}
