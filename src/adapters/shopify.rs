//! Shopify adapter: orders rolled up into one commerce campaign per shop.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime};
use reqwest::header::{HeaderMap, LINK};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use super::http::fetch_ok;
use super::normalize::DailyTotals;
use super::{AdapterContext, Snapshot, SyncAdapter, SyncError, SyncResult, SyncWindow};
use crate::models::Provider;
use crate::oauth::shopify::{ADMIN_API_VERSION, normalize_shop_domain, shop_base_url};
use crate::repositories::CampaignUpsert;

/// External id of the synthetic campaign holding a shop's revenue.
pub const ORDERS_CAMPAIGN_ID: &str = "orders";
const PAGE_LIMIT: &str = "250";

pub struct ShopifyAdapter {
    context: AdapterContext,
    api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrdersPage {
    #[serde(default)]
    orders: Vec<Order>,
}

#[derive(Debug, Deserialize)]
struct Order {
    created_at: DateTime<FixedOffset>,
    total_price: String,
    #[serde(default)]
    cancelled_at: Option<String>,
}

/// Extracts the `rel="next"` target of a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(LINK)?.to_str().ok()?;
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}

fn order_totals(order: &Order) -> Result<DailyTotals, SyncError> {
    let revenue: f64 = order.total_price.parse().map_err(|_| {
        SyncError::malformed(format!("shopify total_price {:?}", order.total_price))
    })?;
    Ok(DailyTotals {
        conversions: 1.0,
        revenue: Some(revenue),
        ..DailyTotals::default()
    })
}

/// Daily revenue keyed by the order's shop-local date. Cancelled orders and
/// orders outside the window are ignored.
fn roll_up(orders: &[Order], window: SyncWindow, shop_name: &str) -> Result<Snapshot, SyncError> {
    let mut snapshot = Snapshot {
        campaigns: vec![CampaignUpsert {
            external_id: ORDERS_CAMPAIGN_ID.to_string(),
            name: format!("{shop_name} orders"),
            status: Some("active".to_string()),
        }],
        ..Snapshot::default()
    };
    for order in orders.iter().filter(|o| o.cancelled_at.is_none()) {
        let date = order.created_at.date_naive();
        if window.contains(date) {
            snapshot.add_daily(ORDERS_CAMPAIGN_ID, date, order_totals(order)?);
        }
    }
    Ok(snapshot)
}

impl ShopifyAdapter {
    pub fn new(context: AdapterContext, api_base: Option<String>) -> Self {
        Self { context, api_base }
    }

    async fn read_orders(
        &self,
        shop: &str,
        token: &str,
        window: SyncWindow,
    ) -> Result<Vec<Order>, SyncError> {
        let since = window.start.and_time(NaiveTime::MIN).and_utc().to_rfc3339();
        let first = self
            .context
            .http
            .get(format!(
                "{}/admin/api/{ADMIN_API_VERSION}/orders.json",
                shop_base_url(self.api_base.as_deref(), shop)
            ))
            .query(&[
                ("status", "any"),
                ("created_at_min", since.as_str()),
                ("fields", "id,created_at,total_price,cancelled_at"),
                ("limit", PAGE_LIMIT),
            ]);

        let mut orders = Vec::new();
        let mut request = first;
        loop {
            let fetched = fetch_ok(
                Provider::Shopify,
                request.header("X-Shopify-Access-Token", token),
            )
            .await?;
            let page: OrdersPage = fetched.parse(Provider::Shopify)?;
            orders.extend(page.orders);
            match next_link(&fetched.headers) {
                Some(next) => request = self.context.http.get(next),
                None => return Ok(orders),
            }
        }
    }
}

#[async_trait]
impl SyncAdapter for ShopifyAdapter {
    fn provider(&self) -> Provider {
        Provider::Shopify
    }

    #[instrument(skip(self), fields(provider = "shopify"))]
    async fn sync(&self, integration_id: Uuid) -> Result<SyncResult, SyncError> {
        let (model, token) = self.context.begin(integration_id, Provider::Shopify).await?;
        let shop = normalize_shop_domain(&model.external_account_id)?;
        let window = self.context.window();

        let orders = self.read_orders(&shop, &token, window).await?;
        let shop_name = model.external_account_name.as_deref().unwrap_or(&shop);
        let snapshot = roll_up(&orders, window, shop_name)?;
        let result = self
            .context
            .persist(&model, Provider::Shopify, snapshot)
            .await?;
        info!(
            orders = orders.len(),
            metrics = result.metrics_upserted,
            "shopify sync finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use reqwest::header::HeaderValue;

    fn order(created_at: &str, total: &str, cancelled: bool) -> Order {
        Order {
            created_at: DateTime::parse_from_rfc3339(created_at).unwrap(),
            total_price: total.to_string(),
            cancelled_at: cancelled.then(|| "2026-05-02T00:00:00Z".to_string()),
        }
    }

    fn may() -> SyncWindow {
        SyncWindow {
            start: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 5, 31).unwrap(),
        }
    }

    #[test]
    fn rolls_orders_into_daily_revenue() {
        let orders = vec![
            order("2026-05-01T09:00:00-04:00", "10.00", false),
            order("2026-05-01T23:30:00-04:00", "15.50", false),
            order("2026-05-02T08:00:00-04:00", "99.00", true),
            order("2026-04-30T08:00:00-04:00", "5.00", false),
        ];
        let snapshot = roll_up(&orders, may(), "Demo").unwrap();

        assert_eq!(snapshot.campaigns.len(), 1);
        assert_eq!(snapshot.campaigns[0].name, "Demo orders");
        assert_eq!(snapshot.daily.len(), 1);
        let totals = snapshot.daily[&(
            ORDERS_CAMPAIGN_ID.to_string(),
            NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
        )];
        assert_eq!(totals.revenue, Some(25.5));
        assert_eq!(totals.conversions, 2.0);
        assert_eq!(totals.spend, 0.0);
    }

    #[test]
    fn bad_price_is_malformed() {
        let orders = vec![order("2026-05-01T09:00:00Z", "ten", false)];
        assert!(roll_up(&orders, may(), "Demo").is_err());
    }

    #[test]
    fn finds_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://demo.myshopify.com/admin/api/2024-01/orders.json?page_info=p1>; rel=\"previous\", \
                 <https://demo.myshopify.com/admin/api/2024-01/orders.json?page_info=p2>; rel=\"next\"",
            ),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://demo.myshopify.com/admin/api/2024-01/orders.json?page_info=p2")
        );
        assert_eq!(next_link(&HeaderMap::new()), None);
    }
}
