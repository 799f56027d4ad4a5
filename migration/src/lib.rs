//! Database migrations for the ad sync service.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_000001_create_integrations;
mod m2026_01_05_000002_create_campaigns;
mod m2026_01_05_000003_create_metrics;
mod m2026_01_05_000004_create_sync_jobs;
mod m2026_01_05_000005_create_job_schedules;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_000001_create_integrations::Migration),
            Box::new(m2026_01_05_000002_create_campaigns::Migration),
            Box::new(m2026_01_05_000003_create_metrics::Migration),
            Box::new(m2026_01_05_000004_create_sync_jobs::Migration),
            Box::new(m2026_01_05_000005_create_job_schedules::Migration),
        ]
    }
}
