//! Integration repository: credential store and sync status store.
//!
//! Every mutation of a single integration's token or status fields is a
//! filtered `UPDATE` so concurrent refreshes and status transitions cannot
//! overwrite each other. The filter is the expected prior state
//! (`credential_version` for tokens, `sync_status` for the sync lock).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{RepositoryError, is_unique_violation};
use crate::crypto::{CryptoKey, open_token, seal_token};
use crate::models::integration::{self, Column, Entity as Integration, SyncStatus};
use crate::models::Provider;
use crate::oauth::{AccountIdentity, TokenGrant};

/// Plaintext credentials of one integration, as read.
#[derive(Clone)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Version the credentials were read at; token writes must present it.
    pub version: i32,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("version", &self.version)
            .finish()
    }
}

/// Result of trying to take the `syncing` advisory lock.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(integration::Model),
    /// Another job holds the integration.
    Busy,
    /// Disconnected integrations are not synced.
    Inactive,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct IntegrationRepository {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<integration::Model>, RepositoryError> {
        Ok(Integration::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn require(&self, id: Uuid) -> Result<integration::Model, RepositoryError> {
        self.get(id)
            .await?
            .ok_or(RepositoryError::IntegrationNotFound(id))
    }

    pub async fn find_by_natural_key(
        &self,
        tenant_id: Uuid,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<integration::Model>, RepositoryError> {
        Ok(Integration::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Provider.eq(provider.as_str()))
            .filter(Column::ExternalAccountId.eq(external_account_id))
            .one(&*self.db)
            .await?)
    }

    /// Active integrations of one tenant, or of every tenant when `tenant_id` is `None`.
    pub async fn list_active(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<integration::Model>, RepositoryError> {
        let mut query = Integration::find().filter(Column::Active.eq(true));
        if let Some(tenant_id) = tenant_id {
            query = query.filter(Column::TenantId.eq(tenant_id));
        }
        Ok(query
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Persists the credentials of a completed OAuth exchange.
    ///
    /// Creates the integration on first connect. Re-authorizing an existing
    /// account replaces its credentials, reactivates it and clears an `error`
    /// status, in one statement.
    pub async fn upsert_from_grant(
        &self,
        tenant_id: Uuid,
        provider: Provider,
        account: &AccountIdentity,
        grant: &TokenGrant,
    ) -> Result<integration::Model, RepositoryError> {
        if let Some(existing) = self
            .find_by_natural_key(tenant_id, provider, &account.external_account_id)
            .await?
        {
            return self.replace_credentials(existing, account, grant).await;
        }

        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();
        let aad = integration::credential_aad(
            tenant_id,
            provider.as_str(),
            &account.external_account_id,
        );
        let model = integration::ActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id),
            provider: Set(provider.as_str().to_string()),
            external_account_id: Set(account.external_account_id.clone()),
            external_account_name: Set(account.external_account_name.clone()),
            access_token_ciphertext: Set(seal_token(&self.crypto_key, &aad, &grant.access_token)?),
            refresh_token_ciphertext: Set(grant
                .refresh_token
                .as_deref()
                .map(|token| seal_token(&self.crypto_key, &aad, token))
                .transpose()?),
            token_expires_at: Set(grant.expires_at.map(|at| at.fixed_offset())),
            credential_version: Set(1),
            active: Set(true),
            sync_status: Set(SyncStatus::Idle.as_str().to_string()),
            last_sync_at: Set(None),
            sync_claimed_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match Integration::insert(model).exec_without_returning(&*self.db).await {
            Ok(_) => {
                tracing::info!(integration_id = %id, %tenant_id, %provider, "integration created");
                self.require(id).await
            }
            Err(err) if is_unique_violation(&err) => {
                // A concurrent callback for the same account won the insert.
                let existing = self
                    .find_by_natural_key(tenant_id, provider, &account.external_account_id)
                    .await?
                    .ok_or(RepositoryError::Database(err))?;
                self.replace_credentials(existing, account, grant).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replace_credentials(
        &self,
        existing: integration::Model,
        account: &AccountIdentity,
        grant: &TokenGrant,
    ) -> Result<integration::Model, RepositoryError> {
        let aad = existing.credential_aad();
        let access = seal_token(&self.crypto_key, &aad, &grant.access_token)?;
        let refresh = grant
            .refresh_token
            .as_deref()
            .map(|token| seal_token(&self.crypto_key, &aad, token))
            .transpose()?;
        let now = Utc::now().fixed_offset();

        let mut update = Integration::update_many()
            .col_expr(Column::AccessTokenCiphertext, Expr::value(access))
            .col_expr(Column::RefreshTokenCiphertext, Expr::value(refresh))
            .col_expr(
                Column::TokenExpiresAt,
                Expr::value(grant.expires_at.map(|at| at.fixed_offset())),
            )
            .col_expr(
                Column::CredentialVersion,
                Expr::col(Column::CredentialVersion).add(1),
            )
            .col_expr(Column::Active, Expr::value(true))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(existing.id));
        if account.external_account_name.is_some() {
            update = update.col_expr(
                Column::ExternalAccountName,
                Expr::value(account.external_account_name.clone()),
            );
        }
        update.exec(&*self.db).await?;

        // Separate statement so a sync in flight keeps its `syncing` claim.
        Integration::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::Idle.as_str()))
            .col_expr(Column::LastError, Expr::value(Option::<JsonValue>::None))
            .filter(Column::Id.eq(existing.id))
            .filter(Column::SyncStatus.eq(SyncStatus::Error.as_str()))
            .exec(&*self.db)
            .await?;

        tracing::info!(
            integration_id = %existing.id,
            provider = %existing.provider,
            "integration re-authorized"
        );
        self.require(existing.id).await
    }

    pub fn decrypt_credentials(
        &self,
        model: &integration::Model,
    ) -> Result<StoredCredentials, RepositoryError> {
        let aad = model.credential_aad();
        Ok(StoredCredentials {
            access_token: open_token(&self.crypto_key, &aad, &model.access_token_ciphertext)?,
            refresh_token: model
                .refresh_token_ciphertext
                .as_deref()
                .map(|sealed| open_token(&self.crypto_key, &aad, sealed))
                .transpose()?,
            expires_at: model.token_expires_at.map(|at| at.with_timezone(&Utc)),
            version: model.credential_version,
        })
    }

    /// Writes a refreshed access token if the credentials are still at
    /// `expected_version`. Returns `false` when another writer got there first,
    /// in which case nothing is changed.
    pub async fn store_refreshed_token(
        &self,
        model: &integration::Model,
        expected_version: i32,
        access_token: &str,
        rotated_refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let aad = model.credential_aad();
        let mut update = Integration::update_many()
            .col_expr(
                Column::AccessTokenCiphertext,
                Expr::value(seal_token(&self.crypto_key, &aad, access_token)?),
            )
            .col_expr(
                Column::TokenExpiresAt,
                Expr::value(expires_at.map(|at| at.fixed_offset())),
            )
            .col_expr(
                Column::CredentialVersion,
                Expr::col(Column::CredentialVersion).add(1),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));
        if let Some(refresh) = rotated_refresh_token {
            update = update.col_expr(
                Column::RefreshTokenCiphertext,
                Expr::value(Some(seal_token(&self.crypto_key, &aad, refresh)?)),
            );
        }

        let result = update
            .filter(Column::Id.eq(model.id))
            .filter(Column::CredentialVersion.eq(expected_version))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Marks the integration inactive; campaigns and metrics are kept.
    pub async fn disconnect(&self, id: Uuid) -> Result<integration::Model, RepositoryError> {
        let result = Integration::update_many()
            .col_expr(Column::Active, Expr::value(false))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::IntegrationNotFound(id));
        }
        tracing::info!(integration_id = %id, "integration disconnected");
        self.require(id).await
    }

    /// Takes the `syncing` lock unless another job already holds it.
    pub async fn claim_for_sync(&self, id: Uuid) -> Result<ClaimOutcome, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let result = Integration::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::Syncing.as_str()))
            .col_expr(Column::SyncClaimedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Active.eq(true))
            .filter(Column::SyncStatus.ne(SyncStatus::Syncing.as_str()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 1 {
            return Ok(ClaimOutcome::Claimed(self.require(id).await?));
        }

        Ok(match self.get(id).await? {
            None => ClaimOutcome::NotFound,
            Some(model) if !model.active => ClaimOutcome::Inactive,
            Some(_) => ClaimOutcome::Busy,
        })
    }

    /// Releases the lock after a successful run.
    pub async fn mark_synced(
        &self,
        id: Uuid,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let at = synced_at.fixed_offset();
        let result = Integration::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::Idle.as_str()))
            .col_expr(Column::LastSyncAt, Expr::value(Some(at)))
            .col_expr(
                Column::SyncClaimedAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::LastError, Expr::value(Option::<JsonValue>::None))
            .col_expr(Column::UpdatedAt, Expr::value(at))
            .filter(Column::Id.eq(id))
            .filter(Column::SyncStatus.eq(SyncStatus::Syncing.as_str()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            tracing::warn!(integration_id = %id, "sync finished but claim was no longer held");
        }
        Ok(result.rows_affected == 1)
    }

    /// Releases the lock after a failed run. `last_sync_at` stays at the last success.
    pub async fn mark_error(&self, id: Uuid, error: JsonValue) -> Result<bool, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let result = Integration::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::Error.as_str()))
            .col_expr(Column::LastError, Expr::value(Some(error)))
            .col_expr(
                Column::SyncClaimedAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::SyncStatus.eq(SyncStatus::Syncing.as_str()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            tracing::warn!(integration_id = %id, "sync failed but claim was no longer held");
        }
        Ok(result.rows_affected == 1)
    }

    /// Frees `syncing` claims older than `older_than`, left behind by a
    /// worker that died mid-run. They settle to `error`.
    pub async fn release_stale_claims(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let result = Integration::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::Error.as_str()))
            .col_expr(
                Column::LastError,
                Expr::value(Some(serde_json::json!({
                    "type": "abandoned",
                    "message": "sync claim expired before the run reported back"
                }))),
            )
            .col_expr(
                Column::SyncClaimedAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::SyncStatus.eq(SyncStatus::Syncing.as_str()))
            .filter(Column::SyncClaimedAt.lt(older_than.fixed_offset()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            tracing::warn!(released = result.rows_affected, "released stale sync claims");
        }
        Ok(result.rows_affected)
    }
}
