//! SyncJob entity model
//!
//! Durable queue record. `state` walks `waiting -> active -> {completed |
//! waiting (retry) | failed}`; terminal rows are kept for a retention window.

use std::{fmt, str::FromStr};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{Provider, UnknownVariant};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `sync-provider` or `sync-all`
    pub kind: String,

    /// Serialized [`JobPayload`]
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// `waiting`, `active`, `completed` or `failed`
    pub state: String,

    /// Executions started so far, incremented when the job is claimed
    pub attempt_count: i32,

    pub max_attempts: i32,

    /// Base delay for exponential backoff between attempts
    pub backoff_base_ms: i64,

    /// At most one waiting/active job may carry a given key
    pub dedupe_key: Option<String>,

    /// Earliest time the job may be claimed
    pub run_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Last failure, serialized sync error
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_error: Option<JsonValue>,

    /// Outcome summary recorded on completion
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub result: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn kind(&self) -> Result<JobKind, UnknownVariant> {
        self.kind.parse()
    }

    pub fn state(&self) -> Result<JobState, UnknownVariant> {
        self.state.parse()
    }

    pub fn payload(&self) -> Result<JobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// What a job asks the worker pool to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Sync a single integration
    SyncProvider,
    /// Expand into one unit per active integration of a tenant, or of the fleet
    SyncAll,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncProvider => "sync-provider",
            JobKind::SyncAll => "sync-all",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sync-provider" => Ok(JobKind::SyncProvider),
            "sync-all" => Ok(JobKind::SyncAll),
            other => Err(UnknownVariant::new("job kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(UnknownVariant::new("job state", other)),
        }
    }
}

/// Job arguments. A `sync-all` payload without a tenant targets the whole fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

impl JobPayload {
    pub fn fleet() -> Self {
        Self::default()
    }

    pub fn tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn integration(tenant_id: Uuid, integration_id: Uuid, provider: Provider) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            integration_id: Some(integration_id),
            provider: Some(provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fleet_payload_serializes_empty() {
        assert_eq!(serde_json::to_value(JobPayload::fleet()).unwrap(), json!({}));
    }

    #[test]
    fn integration_payload_uses_provider_slug() {
        let tenant = Uuid::new_v4();
        let integration = Uuid::new_v4();
        let value =
            serde_json::to_value(JobPayload::integration(tenant, integration, Provider::Meta))
                .unwrap();
        assert_eq!(value["provider"], json!("meta"));
        assert_eq!(value["integration_id"], json!(integration.to_string()));
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert_eq!("sync-all".parse::<JobKind>(), Ok(JobKind::SyncAll));
    }
}
