//! Creates the campaigns table, keyed naturally by (integration_id, external_id).

use sea_orm_migration::prelude::*;

use crate::m2026_01_05_000001_create_integrations::Integrations;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Campaigns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Campaigns::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Campaigns::IntegrationId).uuid().not_null())
                    .col(ColumnDef::new(Campaigns::Provider).text().not_null())
                    .col(ColumnDef::new(Campaigns::ExternalId).text().not_null())
                    .col(ColumnDef::new(Campaigns::Name).text().not_null())
                    .col(ColumnDef::new(Campaigns::Status).text().null())
                    .col(
                        ColumnDef::new(Campaigns::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Campaigns::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_campaigns_integration_id")
                            .from(Campaigns::Table, Campaigns::IntegrationId)
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_campaigns_integration_external")
                    .table(Campaigns::Table)
                    .col(Campaigns::IntegrationId)
                    .col(Campaigns::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_campaigns_integration_external")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Campaigns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Campaigns {
    Table,
    Id,
    IntegrationId,
    Provider,
    ExternalId,
    Name,
    Status,
    CreatedAt,
    UpdatedAt,
}
