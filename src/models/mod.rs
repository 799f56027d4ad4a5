//! # Data Models
//!
//! SeaORM entities for integrations, campaigns, metrics and the job queue,
//! plus the small enums stored in their text columns.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub mod campaign;
pub mod integration;
pub mod job_schedule;
pub mod metric;
pub mod provider;
pub mod sync_job;

pub use campaign::Entity as Campaign;
pub use integration::Entity as Integration;
pub use job_schedule::Entity as JobSchedule;
pub use metric::Entity as Metric;
pub use provider::Provider;
pub use sync_job::Entity as SyncJob;

/// A text column held a value outside its enum vocabulary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
