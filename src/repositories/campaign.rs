//! Campaign upserts keyed by (integration_id, external_id).

use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use super::RepositoryError;
use crate::models::Provider;
use crate::models::campaign::{self, Column, Entity as Campaign};

/// Canonical campaign as produced by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignUpsert {
    pub external_id: String,
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CampaignRepository {
    db: Arc<DatabaseConnection>,
}

impl CampaignRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts or updates the campaign and returns its local id.
    pub async fn upsert(
        &self,
        integration_id: Uuid,
        provider: Provider,
        record: &CampaignUpsert,
    ) -> Result<Uuid, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let model = campaign::ActiveModel {
            id: Set(Uuid::new_v4()),
            integration_id: Set(integration_id),
            provider: Set(provider.as_str().to_string()),
            external_id: Set(record.external_id.clone()),
            name: Set(record.name.clone()),
            status: Set(record.status.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Campaign::insert(model)
            .on_conflict(
                OnConflict::columns([Column::IntegrationId, Column::ExternalId])
                    .update_columns([Column::Name, Column::Status, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        let stored = Campaign::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .filter(Column::ExternalId.eq(record.external_id.as_str()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                sea_orm::DbErr::RecordNotFound(format!(
                    "campaign {} of integration {integration_id}",
                    record.external_id
                ))
            })?;
        Ok(stored.id)
    }

    pub async fn list_for_integration(
        &self,
        integration_id: Uuid,
    ) -> Result<Vec<campaign::Model>, RepositoryError> {
        Ok(Campaign::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .order_by_asc(Column::ExternalId)
            .all(&*self.db)
            .await?)
    }
}
