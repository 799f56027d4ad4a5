//! # Platform Sync Adapters
//!
//! One adapter per provider behind [`SyncAdapter`]. Each resolves a usable
//! token, reads campaigns and a daily metrics window, parses everything, and
//! only then upserts canonical rows.

pub mod google_ads;
mod http;
pub mod meta;
pub mod normalize;
pub mod registry;
pub mod shopify;
pub mod trait_;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

pub use google_ads::GoogleAdsAdapter;
pub use meta::MetaAdapter;
pub use registry::{AdapterRegistry, RegistryError};
pub use shopify::ShopifyAdapter;
pub use trait_::{SyncAdapter, SyncError, SyncErrorKind, SyncResult};

use crate::models::{Provider, integration};
use crate::oauth::TokenManager;
use crate::repositories::{
    CampaignRepository, CampaignUpsert, IntegrationRepository, MetricRepository,
};
use normalize::{DailyTotals, metric_row};

/// Handles every adapter needs: credentials, storage and an HTTP client.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub integrations: Arc<IntegrationRepository>,
    pub tokens: Arc<TokenManager>,
    pub campaigns: Arc<CampaignRepository>,
    pub metrics: Arc<MetricRepository>,
    pub http: reqwest::Client,
    pub window_days: u32,
}

impl AdapterContext {
    /// Loads the integration and a token valid for the whole run.
    pub(crate) async fn begin(
        &self,
        integration_id: Uuid,
        provider: Provider,
    ) -> Result<(integration::Model, String), SyncError> {
        let model = self.integrations.require(integration_id).await?;
        if model.provider()? != provider {
            return Err(SyncError::configuration(format!(
                "integration {integration_id} belongs to {}, not {provider}",
                model.provider
            )));
        }
        let token = self.tokens.resolve_valid_token(&model).await?;
        Ok((model, token))
    }

    pub(crate) fn window(&self) -> SyncWindow {
        SyncWindow::current(self.window_days)
    }

    /// Writes a fully parsed snapshot. Metric rows whose campaign is not in
    /// the snapshot are dropped.
    pub(crate) async fn persist(
        &self,
        model: &integration::Model,
        provider: Provider,
        snapshot: Snapshot,
    ) -> Result<SyncResult, SyncError> {
        let mut local_ids = BTreeMap::new();
        for campaign in &snapshot.campaigns {
            let id = self.campaigns.upsert(model.id, provider, campaign).await?;
            local_ids.insert(campaign.external_id.clone(), id);
        }

        let mut metrics_upserted = 0;
        for ((external_id, date), totals) in snapshot.daily {
            let Some(campaign_id) = local_ids.get(&external_id) else {
                debug!(%external_id, %date, "metrics for unknown campaign skipped");
                continue;
            };
            self.metrics
                .upsert(*campaign_id, &metric_row(date, totals))
                .await?;
            metrics_upserted += 1;
        }

        Ok(SyncResult {
            campaigns_upserted: local_ids.len(),
            metrics_upserted,
        })
    }
}

/// Everything one run read from the provider, before any write.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub campaigns: Vec<CampaignUpsert>,
    /// Keyed by (campaign external id, date); repeated keys are summed.
    pub daily: BTreeMap<(String, NaiveDate), DailyTotals>,
}

impl Snapshot {
    pub fn add_daily(&mut self, external_id: &str, date: NaiveDate, totals: DailyTotals) {
        self.daily
            .entry((external_id.to_string(), date))
            .or_default()
            .add(&totals);
    }
}

/// Inclusive date range ending today (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SyncWindow {
    pub fn trailing_days(days: u32, today: NaiveDate) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: today - Duration::days(span),
            end: today,
        }
    }

    pub fn current(days: u32) -> Self {
        Self::trailing_days(days, Utc::now().date_naive())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_inclusive_of_today() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let window = SyncWindow::trailing_days(30, today);
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert!(window.contains(today));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()));
    }

    #[test]
    fn zero_days_still_covers_today() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let window = SyncWindow::trailing_days(0, today);
        assert_eq!(window.start, today);
        assert_eq!(window.end, today);
    }
}
