//! # Repository Layer
//!
//! SeaORM access for integrations (credential and status store) and the
//! campaign/metric mirror. Writes that race with other workers are
//! compare-and-set updates whose row count tells the caller who won.

use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::models::UnknownVariant;

pub mod campaign;
pub mod integration;
pub mod metric;

pub use campaign::{CampaignRepository, CampaignUpsert};
pub use integration::{ClaimOutcome, IntegrationRepository, StoredCredentials};
pub use metric::{MetricRepository, MetricUpsert};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("credential error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("integration {0} not found")]
    IntegrationNotFound(Uuid),
    #[error(transparent)]
    InvalidValue(#[from] UnknownVariant),
}

/// True when `error` is a unique-constraint violation on Postgres or SQLite.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_UNIQUE_CODES: &[&str] = &["1555", "2067"];

    if matches!(
        error.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    ) {
        return true;
    }

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code: &str = &code;
        code == PG_UNIQUE || SQLITE_UNIQUE_CODES.contains(&code)
    })
}
