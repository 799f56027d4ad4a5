//! Creates the integrations table.
//!
//! One row per connected provider account for a tenant. Credentials are stored
//! encrypted; `credential_version` backs compare-and-set token writes and
//! `sync_status` doubles as the per-integration advisory lock.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Integrations::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Integrations::Provider).text().not_null())
                    .col(
                        ColumnDef::new(Integrations::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::ExternalAccountName)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::CredentialVersion)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Integrations::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Integrations::SyncStatus)
                            .text()
                            .not_null()
                            .default("idle"),
                    )
                    .col(
                        ColumnDef::new(Integrations::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::SyncClaimedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Integrations::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
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
                    .name("idx_integrations_tenant_provider_account")
                    .table(Integrations::Table)
                    .col(Integrations::TenantId)
                    .col(Integrations::Provider)
                    .col(Integrations::ExternalAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_active_status")
                    .table(Integrations::Table)
                    .col(Integrations::Active)
                    .col(Integrations::SyncStatus)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integrations_active_status")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integrations_tenant_provider_account")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Integrations {
    Table,
    Id,
    TenantId,
    Provider,
    ExternalAccountId,
    ExternalAccountName,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    TokenExpiresAt,
    CredentialVersion,
    Active,
    SyncStatus,
    LastSyncAt,
    SyncClaimedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
