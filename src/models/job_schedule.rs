//! JobSchedule entity model
//!
//! A standing recurring registration. The scheduler turns a due row into a
//! `sync_jobs` row carrying the same dedupe key.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "job_schedules")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub dedupe_key: String,
    pub kind: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,
    /// Six-field cron expression (seconds first)
    pub cron_spec: String,
    pub next_run_at: DateTimeWithTimeZone,
    pub last_enqueued_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
