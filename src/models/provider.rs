//! Supported providers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::UnknownVariant;

/// External platform an integration is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Google Ads (ad network, refresh-token grant)
    GoogleAds,
    /// Meta Marketing API (ad network, long-lived token, no refresh)
    Meta,
    /// Shopify Admin API (commerce, non-expiring offline token)
    Shopify,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::GoogleAds, Provider::Meta, Provider::Shopify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GoogleAds => "google-ads",
            Provider::Meta => "meta",
            Provider::Shopify => "shopify",
        }
    }

    /// Whether the provider reports ad spend (as opposed to commerce revenue).
    pub fn is_ad_network(&self) -> bool {
        !matches!(self, Provider::Shopify)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "google-ads" | "google_ads" => Ok(Provider::GoogleAds),
            "meta" => Ok(Provider::Meta),
            "shopify" => Ok(Provider::Shopify),
            other => Err(UnknownVariant::new("provider", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slugs_and_legacy_underscore_form() {
        assert_eq!("google-ads".parse::<Provider>(), Ok(Provider::GoogleAds));
        assert_eq!("google_ads".parse::<Provider>(), Ok(Provider::GoogleAds));
        assert_eq!("shopify".parse::<Provider>(), Ok(Provider::Shopify));
        assert!("tiktok".parse::<Provider>().is_err());
    }

    #[test]
    fn serializes_as_kebab_case() {
        let json = serde_json::to_string(&Provider::GoogleAds).unwrap();
        assert_eq!(json, "\"google-ads\"");
        for provider in Provider::ALL {
            assert_eq!(provider.to_string(), provider.as_str());
        }
    }
}
