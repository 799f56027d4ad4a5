//! Derived ratios for canonical metric rows.
//!
//! A ratio whose denominator is zero is stored as NULL, never as 0 or inf.
//! Cost ratios are NULL as well when nothing was spent.

use chrono::NaiveDate;

use crate::repositories::MetricUpsert;

/// Raw daily figures as reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailyTotals {
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
    pub conversions: f64,
    pub revenue: Option<f64>,
}

impl DailyTotals {
    pub fn add(&mut self, other: &DailyTotals) {
        self.impressions += other.impressions;
        self.clicks += other.clicks;
        self.spend += other.spend;
        self.conversions += other.conversions;
        self.revenue = match (self.revenue, other.revenue) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
    }
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0).then(|| numerator / denominator)
}

/// Cost per unit. Rows with no spend (commerce rows) have no cost to divide.
fn cost_per(spend: f64, units: f64) -> Option<f64> {
    if spend > 0.0 { ratio(spend, units) } else { None }
}

pub fn metric_row(date: NaiveDate, totals: DailyTotals) -> MetricUpsert {
    MetricUpsert {
        date,
        impressions: totals.impressions,
        clicks: totals.clicks,
        spend: totals.spend,
        conversions: totals.conversions,
        revenue: totals.revenue,
        ctr: ratio(totals.clicks as f64, totals.impressions as f64),
        cpc: cost_per(totals.spend, totals.clicks as f64),
        cpa: cost_per(totals.spend, totals.conversions),
        roas: totals.revenue.and_then(|revenue| ratio(revenue, totals.spend)),
    }
}

/// Google reports cost in millionths of the account currency.
pub fn micros_to_units(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()
    }

    #[test]
    fn derives_ratios() {
        let row = metric_row(
            day(),
            DailyTotals {
                impressions: 1000,
                clicks: 50,
                spend: 100.0,
                conversions: 4.0,
                revenue: Some(400.0),
            },
        );
        assert_eq!(row.ctr, Some(0.05));
        assert_eq!(row.cpc, Some(2.0));
        assert_eq!(row.cpa, Some(25.0));
        assert_eq!(row.roas, Some(4.0));
    }

    #[test]
    fn zero_denominators_are_null() {
        let row = metric_row(
            day(),
            DailyTotals {
                clicks: 7,
                revenue: Some(120.0),
                conversions: 3.0,
                ..DailyTotals::default()
            },
        );
        assert_eq!(row.ctr, None);
        assert_eq!(row.cpc, None);
        assert_eq!(row.cpa, None);
        assert_eq!(row.roas, None);
        assert_eq!(row.revenue, Some(120.0));
    }

    #[test]
    fn ad_rows_without_revenue_have_no_roas() {
        let row = metric_row(
            day(),
            DailyTotals {
                impressions: 10,
                clicks: 1,
                spend: 5.0,
                ..DailyTotals::default()
            },
        );
        assert_eq!(row.revenue, None);
        assert_eq!(row.roas, None);
    }

    #[test]
    fn adds_totals() {
        let mut total = DailyTotals::default();
        total.add(&DailyTotals {
            revenue: Some(10.0),
            conversions: 1.0,
            ..DailyTotals::default()
        });
        total.add(&DailyTotals {
            revenue: Some(5.5),
            conversions: 1.0,
            ..DailyTotals::default()
        });
        assert_eq!(total.revenue, Some(15.5));
        assert_eq!(total.conversions, 2.0);
    }

    #[test]
    fn converts_micros() {
        assert_eq!(micros_to_units(2_500_000), 2.5);
    }
}
