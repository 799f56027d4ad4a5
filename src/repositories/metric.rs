//! Daily metric upserts keyed by (campaign_id, date).
//!
//! Re-running a sync over an overlapping window overwrites the stored figures
//! for each date instead of adding to them.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use super::RepositoryError;
use crate::models::metric::{self, Column, Entity as Metric};

/// Canonical daily figures with derived ratios already computed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpsert {
    pub date: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
    pub conversions: f64,
    pub revenue: Option<f64>,
    pub ctr: Option<f64>,
    pub cpc: Option<f64>,
    pub cpa: Option<f64>,
    pub roas: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MetricRepository {
    db: Arc<DatabaseConnection>,
}

impl MetricRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        campaign_id: Uuid,
        record: &MetricUpsert,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().fixed_offset();
        let model = metric::ActiveModel {
            id: Set(Uuid::new_v4()),
            campaign_id: Set(campaign_id),
            date: Set(record.date),
            impressions: Set(record.impressions),
            clicks: Set(record.clicks),
            spend: Set(record.spend),
            conversions: Set(record.conversions),
            revenue: Set(record.revenue),
            ctr: Set(record.ctr),
            cpc: Set(record.cpc),
            cpa: Set(record.cpa),
            roas: Set(record.roas),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Metric::insert(model)
            .on_conflict(
                OnConflict::columns([Column::CampaignId, Column::Date])
                    .update_columns([
                        Column::Impressions,
                        Column::Clicks,
                        Column::Spend,
                        Column::Conversions,
                        Column::Revenue,
                        Column::Ctr,
                        Column::Cpc,
                        Column::Cpa,
                        Column::Roas,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn list_for_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<metric::Model>, RepositoryError> {
        Ok(Metric::find()
            .filter(Column::CampaignId.eq(campaign_id))
            .order_by_asc(Column::Date)
            .all(&*self.db)
            .await?)
    }
}
