//! Google Ads adapter: the campaign list, then one GAQL report, campaign x day.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::http::fetch_ok;
use super::normalize::{DailyTotals, micros_to_units};
use super::{AdapterContext, Snapshot, SyncAdapter, SyncError, SyncResult, SyncWindow};
use crate::models::Provider;
use crate::oauth::google_ads::API_VERSION;
use crate::repositories::CampaignUpsert;

pub struct GoogleAdsAdapter {
    context: AdapterContext,
    api_base: String,
    developer_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "R: Deserialize<'de>"))]
struct SearchPage<R> {
    #[serde(default = "Vec::new")]
    results: Vec<R>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CampaignRow {
    campaign: CampaignFields,
}

#[derive(Debug, Deserialize)]
struct ReportRow {
    campaign: CampaignFields,
    segments: Segments,
    #[serde(default)]
    metrics: MetricFields,
}

#[derive(Debug, Deserialize)]
struct CampaignFields {
    #[serde(deserialize_with = "int64")]
    id: i64,
    name: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Segments {
    date: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricFields {
    #[serde(default, deserialize_with = "int64")]
    impressions: i64,
    #[serde(default, deserialize_with = "int64")]
    clicks: i64,
    #[serde(default, deserialize_with = "int64")]
    cost_micros: i64,
    #[serde(default)]
    conversions: f64,
}

/// The REST API encodes int64 as a JSON string.
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Every campaign on the account, whether or not it served in the window.
const CAMPAIGN_QUERY: &str = "SELECT campaign.id, campaign.name, campaign.status \
     FROM campaign WHERE campaign.status != 'REMOVED'";

fn report_query(window: SyncWindow) -> String {
    format!(
        "SELECT campaign.id, campaign.name, campaign.status, segments.date, \
         metrics.impressions, metrics.clicks, metrics.cost_micros, metrics.conversions \
         FROM campaign WHERE segments.date BETWEEN '{}' AND '{}'",
        window.start.format("%Y-%m-%d"),
        window.end.format("%Y-%m-%d")
    )
}

impl GoogleAdsAdapter {
    pub fn new(context: AdapterContext, api_base: String, developer_token: String) -> Self {
        Self {
            context,
            api_base: api_base.trim_end_matches('/').to_string(),
            developer_token,
        }
    }

    /// Runs one GAQL query to the last page.
    async fn search<R: DeserializeOwned>(
        &self,
        customer_id: &str,
        token: &str,
        query: &str,
    ) -> Result<Vec<R>, SyncError> {
        let url = format!(
            "{}/{API_VERSION}/customers/{customer_id}/googleAds:search",
            self.api_base
        );
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut body = json!({ "query": query });
            if let Some(next) = &page_token {
                body["pageToken"] = json!(next);
            }
            let request = self
                .context
                .http
                .post(&url)
                .bearer_auth(token)
                .header("developer-token", &self.developer_token)
                .json(&body);
            let page: SearchPage<R> = fetch_ok(Provider::GoogleAds, request)
                .await?
                .parse(Provider::GoogleAds)?;
            rows.extend(page.results);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(rows)
    }

    async fn read_snapshot(
        &self,
        customer_id: &str,
        token: &str,
        window: SyncWindow,
    ) -> Result<Snapshot, SyncError> {
        let mut snapshot = Snapshot::default();
        let listed: Vec<CampaignRow> = self.search(customer_id, token, CAMPAIGN_QUERY).await?;
        for row in listed {
            add_campaign(&mut snapshot, row.campaign);
        }

        let report: Vec<ReportRow> = self
            .search(customer_id, token, &report_query(window))
            .await?;
        for row in report {
            // Removed campaigns can still carry spend inside the window.
            let external_id = add_campaign(&mut snapshot, row.campaign);
            snapshot.add_daily(
                &external_id,
                row.segments.date,
                DailyTotals {
                    impressions: row.metrics.impressions,
                    clicks: row.metrics.clicks,
                    spend: micros_to_units(row.metrics.cost_micros),
                    conversions: row.metrics.conversions,
                    revenue: None,
                },
            );
        }

        Ok(snapshot)
    }
}

/// Adds the campaign once and returns its external id.
fn add_campaign(snapshot: &mut Snapshot, campaign: CampaignFields) -> String {
    let external_id = campaign.id.to_string();
    if !snapshot
        .campaigns
        .iter()
        .any(|c| c.external_id == external_id)
    {
        snapshot.campaigns.push(CampaignUpsert {
            external_id: external_id.clone(),
            name: campaign.name,
            status: campaign.status,
        });
    }
    external_id
}

#[async_trait]
impl SyncAdapter for GoogleAdsAdapter {
    fn provider(&self) -> Provider {
        Provider::GoogleAds
    }

    #[instrument(skip(self), fields(provider = "google-ads"))]
    async fn sync(&self, integration_id: Uuid) -> Result<SyncResult, SyncError> {
        let (model, token) = self.context.begin(integration_id, Provider::GoogleAds).await?;
        let customer_id = model.external_account_id.replace('-', "");
        let window = self.context.window();

        let snapshot = self.read_snapshot(&customer_id, &token, window).await?;
        let result = self
            .context
            .persist(&model, Provider::GoogleAds, snapshot)
            .await?;
        info!(
            campaigns = result.campaigns_upserted,
            metrics = result.metrics_upserted,
            "google ads sync finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_encoded_int64() {
        let page: SearchPage<ReportRow> = serde_json::from_value(json!({
            "results": [{
                "campaign": { "id": "123", "name": "Brand", "status": "ENABLED" },
                "segments": { "date": "2026-05-01" },
                "metrics": { "impressions": "1000", "clicks": "10", "costMicros": "2500000", "conversions": 1.5 }
            }],
            "nextPageToken": "abc"
        }))
        .unwrap();
        let row = &page.results[0];
        assert_eq!(row.campaign.id, 123);
        assert_eq!(row.metrics.cost_micros, 2_500_000);
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }

    #[test]
    fn query_covers_window() {
        let window = SyncWindow {
            start: NaiveDate::from_ymd_opt(2026, 4, 2).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
        };
        let query = report_query(window);
        assert!(query.contains("BETWEEN '2026-04-02' AND '2026-05-01'"));
        assert!(query.starts_with("SELECT campaign.id"));
        assert!(!CAMPAIGN_QUERY.contains("segments.date"));
    }

    #[test]
    fn campaign_rows_need_no_segments() {
        let page: SearchPage<CampaignRow> = serde_json::from_value(json!({
            "results": [{ "campaign": { "id": "456", "name": "Prospecting", "status": "PAUSED" } }]
        }))
        .unwrap();
        assert_eq!(page.results[0].campaign.id, 456);
        assert!(page.next_page_token.is_none());
    }
}
