//! Meta Marketing API adapter: campaign list plus daily campaign insights.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument};
use uuid::Uuid;

use super::http::{Fetched, classify_status, fetch, retry_after_secs};
use super::normalize::DailyTotals;
use super::{AdapterContext, Snapshot, SyncAdapter, SyncError, SyncResult, SyncWindow};
use crate::models::Provider;
use crate::oauth::meta::GRAPH_VERSION;
use crate::repositories::CampaignUpsert;

/// Graph error codes that mean "throttled".
const RATE_LIMIT_CODES: [i64; 5] = [4, 17, 32, 613, 80004];
const EXPIRED_TOKEN_CODE: i64 = 190;
/// Purchase action types in order of preference; they overlap, so only the
/// first present one is counted.
const PURCHASE_ACTIONS: [&str; 3] = [
    "omni_purchase",
    "purchase",
    "offsite_conversion.fb_pixel_purchase",
];
const PAGE_LIMIT: &str = "100";

pub struct MetaAdapter {
    context: AdapterContext,
    graph_base: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CampaignRow {
    id: String,
    name: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsightRow {
    campaign_id: String,
    date_start: NaiveDate,
    #[serde(default)]
    impressions: Option<String>,
    #[serde(default)]
    clicks: Option<String>,
    #[serde(default)]
    spend: Option<String>,
    #[serde(default)]
    actions: Vec<ActionValue>,
}

#[derive(Debug, Deserialize)]
struct ActionValue {
    action_type: String,
    value: String,
}

fn number<T: std::str::FromStr + Default>(field: &str, raw: Option<&str>) -> Result<T, SyncError> {
    match raw {
        None => Ok(T::default()),
        Some(text) => text
            .parse()
            .map_err(|_| SyncError::malformed(format!("meta insight field {field}={text:?}"))),
    }
}

impl InsightRow {
    fn totals(&self) -> Result<DailyTotals, SyncError> {
        let conversions = PURCHASE_ACTIONS
            .iter()
            .find_map(|wanted| self.actions.iter().find(|a| a.action_type == *wanted))
            .map(|action| number::<f64>("actions", Some(action.value.as_str())))
            .transpose()?
            .unwrap_or(0.0);
        Ok(DailyTotals {
            impressions: number("impressions", self.impressions.as_deref())?,
            clicks: number("clicks", self.clicks.as_deref())?,
            spend: number("spend", self.spend.as_deref())?,
            conversions,
            revenue: None,
        })
    }
}

/// Meta reports most failures as 400 with a Graph error code.
fn classify_graph_error(fetched: &Fetched) -> SyncError {
    let code = serde_json::from_str::<serde_json::Value>(&fetched.body)
        .ok()
        .and_then(|v| v.pointer("/error/code").and_then(serde_json::Value::as_i64));
    match code {
        Some(code) if RATE_LIMIT_CODES.contains(&code) => SyncError::rate_limited(
            retry_after_secs(&fetched.headers),
            format!("meta graph throttled (code {code})"),
        ),
        Some(EXPIRED_TOKEN_CODE) => SyncError::auth_expired("meta access token expired (code 190)"),
        _ => classify_status(Provider::Meta, fetched),
    }
}

impl MetaAdapter {
    pub fn new(context: AdapterContext, graph_base: String) -> Self {
        Self {
            context,
            graph_base: graph_base.trim_end_matches('/').to_string(),
        }
    }

    /// Follows `paging.next` until exhausted.
    async fn read_all<T: DeserializeOwned>(
        &self,
        first: reqwest::RequestBuilder,
    ) -> Result<Vec<T>, SyncError> {
        let mut rows = Vec::new();
        let mut request = first;
        loop {
            let fetched = fetch(Provider::Meta, request).await?;
            if !fetched.status.is_success() {
                return Err(classify_graph_error(&fetched));
            }
            let page: Page<T> = fetched.parse(Provider::Meta)?;
            rows.extend(page.data);
            match page.paging.and_then(|p| p.next) {
                Some(next) => request = self.context.http.get(next),
                None => return Ok(rows),
            }
        }
    }

    async fn read_snapshot(
        &self,
        account_id: &str,
        token: &str,
        window: SyncWindow,
    ) -> Result<Snapshot, SyncError> {
        let campaigns: Vec<CampaignRow> = self
            .read_all(
                self.context
                    .http
                    .get(format!("{}/{GRAPH_VERSION}/{account_id}/campaigns", self.graph_base))
                    .query(&[
                        ("fields", "id,name,status"),
                        ("limit", PAGE_LIMIT),
                        ("access_token", token),
                    ]),
            )
            .await?;

        let time_range = serde_json::json!({
            "since": window.start.format("%Y-%m-%d").to_string(),
            "until": window.end.format("%Y-%m-%d").to_string(),
        })
        .to_string();
        let insights: Vec<InsightRow> = self
            .read_all(
                self.context
                    .http
                    .get(format!("{}/{GRAPH_VERSION}/{account_id}/insights", self.graph_base))
                    .query(&[
                        ("level", "campaign"),
                        ("time_increment", "1"),
                        ("time_range", time_range.as_str()),
                        ("fields", "campaign_id,impressions,clicks,spend,actions"),
                        ("limit", PAGE_LIMIT),
                        ("access_token", token),
                    ]),
            )
            .await?;

        let mut snapshot = Snapshot {
            campaigns: campaigns
                .into_iter()
                .map(|row| CampaignUpsert {
                    external_id: row.id,
                    name: row.name,
                    status: row.status,
                })
                .collect(),
            ..Snapshot::default()
        };
        for row in &insights {
            snapshot.add_daily(&row.campaign_id, row.date_start, row.totals()?);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl SyncAdapter for MetaAdapter {
    fn provider(&self) -> Provider {
        Provider::Meta
    }

    #[instrument(skip(self), fields(provider = "meta"))]
    async fn sync(&self, integration_id: Uuid) -> Result<SyncResult, SyncError> {
        let (model, token) = self.context.begin(integration_id, Provider::Meta).await?;
        let account_id = if model.external_account_id.starts_with("act_") {
            model.external_account_id.clone()
        } else {
            format!("act_{}", model.external_account_id)
        };

        let snapshot = self
            .read_snapshot(&account_id, &token, self.context.window())
            .await?;
        let result = self.context.persist(&model, Provider::Meta, snapshot).await?;
        info!(
            campaigns = result.campaigns_upserted,
            metrics = result.metrics_upserted,
            "meta sync finished"
        );
        Ok(result)
    }
}
