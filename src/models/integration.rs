//! Integration entity model
//!
//! One connected provider account for one tenant. The `sync_status` column is
//! the state machine observed by user-facing reads and doubles as the advisory
//! lock that keeps two workers off the same integration.

use std::{fmt, str::FromStr};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{Provider, UnknownVariant};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Provider slug (`google-ads`, `meta`, `shopify`)
    pub provider: String,

    /// Account identifier on the provider side (customer id, `act_` id, shop domain)
    pub external_account_id: String,

    /// Human readable account name, when the provider exposes one
    pub external_account_name: Option<String>,

    /// AES-GCM encrypted access token
    pub access_token_ciphertext: Vec<u8>,

    /// AES-GCM encrypted refresh token; absent for providers without refresh
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry; absent for non-expiring tokens
    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// Bumped on every credential write; token writes compare against it
    pub credential_version: i32,

    /// False once the tenant disconnects; history is kept
    pub active: bool,

    /// One of `idle`, `syncing`, `completed`, `error`
    pub sync_status: String,

    /// Last successful sync; frozen while the integration is in error
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// When the current `syncing` claim was taken
    pub sync_claimed_at: Option<DateTimeWithTimeZone>,

    /// Serialized failure of the last run, cleared on success
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_error: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::campaign::Entity")]
    Campaign,
}

impl Related<super::campaign::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Campaign.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn provider(&self) -> Result<Provider, UnknownVariant> {
        self.provider.parse()
    }

    pub fn status(&self) -> Result<SyncStatus, UnknownVariant> {
        self.sync_status.parse()
    }

    /// Associated data used to bind ciphertexts to this row.
    pub fn credential_aad(&self) -> String {
        credential_aad(self.tenant_id, &self.provider, &self.external_account_id)
    }
}

pub fn credential_aad(tenant_id: Uuid, provider: &str, external_account_id: &str) -> String {
    format!("{tenant_id}|{provider}|{external_account_id}")
}

/// Persisted sync state of an integration.
///
/// Success settles to `Idle`. `Completed` is accepted when read (older rows
/// carry it) and means the same thing; nothing writes it any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Completed,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Error => "error",
        }
    }

    /// Everything except `syncing` may be claimed by a worker.
    pub fn is_claimable(&self) -> bool {
        !matches!(self, SyncStatus::Syncing)
    }

    /// Collapses the legacy `completed` value onto `idle`.
    pub fn normalized(self) -> Self {
        match self {
            SyncStatus::Completed => SyncStatus::Idle,
            other => other,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "completed" => Ok(SyncStatus::Completed),
            "error" => Ok(SyncStatus::Error),
            other => Err(UnknownVariant::new("sync status", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_is_a_settled_alias_of_idle() {
        assert_eq!(SyncStatus::Completed.normalized(), SyncStatus::Idle);
        assert!(SyncStatus::Completed.is_claimable());
        assert!(!SyncStatus::Syncing.is_claimable());
    }

    #[test]
    fn status_round_trips_through_text_column() {
        for status in [
            SyncStatus::Idle,
            SyncStatus::Syncing,
            SyncStatus::Completed,
            SyncStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>(), Ok(status));
        }
        assert!("paused".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn aad_binds_tenant_provider_and_account() {
        let tenant = Uuid::nil();
        assert_eq!(
            credential_aad(tenant, "meta", "act_1"),
            format!("{tenant}|meta|act_1")
        );
    }
}
