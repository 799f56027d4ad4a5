//! Creates the metrics table: one row per campaign per calendar date.

use sea_orm_migration::prelude::*;

use crate::m2026_01_05_000002_create_campaigns::Campaigns;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Metrics::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Metrics::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Metrics::CampaignId).uuid().not_null())
                    .col(ColumnDef::new(Metrics::Date).date().not_null())
                    .col(
                        ColumnDef::new(Metrics::Impressions)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Metrics::Clicks)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Metrics::Spend).double().not_null().default(0.0))
                    .col(
                        ColumnDef::new(Metrics::Conversions)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(ColumnDef::new(Metrics::Revenue).double().null())
                    .col(ColumnDef::new(Metrics::Ctr).double().null())
                    .col(ColumnDef::new(Metrics::Cpc).double().null())
                    .col(ColumnDef::new(Metrics::Cpa).double().null())
                    .col(ColumnDef::new(Metrics::Roas).double().null())
                    .col(
                        ColumnDef::new(Metrics::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Metrics::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_metrics_campaign_id")
                            .from(Metrics::Table, Metrics::CampaignId)
                            .to(Campaigns::Table, Campaigns::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_metrics_campaign_date")
                    .table(Metrics::Table)
                    .col(Metrics::CampaignId)
                    .col(Metrics::Date)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_metrics_campaign_date").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Metrics::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Metrics {
    Table,
    Id,
    CampaignId,
    Date,
    Impressions,
    Clicks,
    Spend,
    Conversions,
    Revenue,
    Ctr,
    Cpc,
    Cpa,
    Roas,
    CreatedAt,
    UpdatedAt,
}
