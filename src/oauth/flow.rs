//! Per-provider token flow, as a closed set of variants.

use url::Url;

use super::google_ads::GoogleAdsOAuth;
use super::meta::MetaOAuth;
use super::shopify::ShopifyOAuth;
use super::{AccountIdentity, ExchangeExtra, OAuthError, RefreshedToken, TokenGrant};
use crate::config::AppConfig;
use crate::models::Provider;

/// How a provider issues and renews credentials.
///
/// * Google Ads: short-lived access token renewed with a refresh grant.
/// * Meta: long-lived token from a second exchange; no refresh.
/// * Shopify: offline token that never expires.
#[derive(Debug, Clone)]
pub enum TokenFlow {
    RefreshGrant(GoogleAdsOAuth),
    LongLivedExchange(MetaOAuth),
    NonExpiring(ShopifyOAuth),
}

impl TokenFlow {
    /// Builds the flow for `provider` from configuration.
    pub fn from_config(
        provider: Provider,
        http: reqwest::Client,
        config: &AppConfig,
    ) -> Result<Self, OAuthError> {
        Ok(match provider {
            Provider::GoogleAds => Self::RefreshGrant(GoogleAdsOAuth::from_config(http, config)?),
            Provider::Meta => Self::LongLivedExchange(MetaOAuth::from_config(http, config)?),
            Provider::Shopify => Self::NonExpiring(ShopifyOAuth::from_config(http, config)?),
        })
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::RefreshGrant(_) => Provider::GoogleAds,
            Self::LongLivedExchange(_) => Provider::Meta,
            Self::NonExpiring(_) => Provider::Shopify,
        }
    }

    pub fn supports_refresh(&self) -> bool {
        provider_supports_refresh(self.provider())
    }

    pub fn authorize_url(&self, state: &str, extra: &ExchangeExtra) -> Result<Url, OAuthError> {
        match self {
            Self::RefreshGrant(flow) => flow.authorize_url(state),
            Self::LongLivedExchange(flow) => flow.authorize_url(state),
            Self::NonExpiring(flow) => flow.authorize_url(require_shop(extra)?, state),
        }
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        extra: &ExchangeExtra,
    ) -> Result<TokenGrant, OAuthError> {
        match self {
            Self::RefreshGrant(flow) => flow.exchange_code(code).await,
            Self::LongLivedExchange(flow) => flow.exchange_code(code).await,
            Self::NonExpiring(flow) => flow.exchange_code(require_shop(extra)?, code).await,
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, OAuthError> {
        match self {
            Self::RefreshGrant(flow) => flow.refresh(refresh_token).await,
            other => Err(OAuthError::Unsupported {
                provider: other.provider(),
            }),
        }
    }

    pub async fn discover_account(
        &self,
        access_token: &str,
        extra: &ExchangeExtra,
    ) -> Result<AccountIdentity, OAuthError> {
        match self {
            Self::RefreshGrant(flow) => flow.discover_account(access_token).await,
            Self::LongLivedExchange(flow) => flow.discover_account(access_token).await,
            Self::NonExpiring(flow) => {
                flow.discover_account(require_shop(extra)?, access_token)
                    .await
            }
        }
    }
}

/// Only Google Ads has a refresh grant.
pub fn provider_supports_refresh(provider: Provider) -> bool {
    matches!(provider, Provider::GoogleAds)
}

fn require_shop(extra: &ExchangeExtra) -> Result<&str, OAuthError> {
    extra
        .shop
        .as_deref()
        .ok_or_else(|| OAuthError::InvalidRequest("shopify requires a shop domain".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_google_ads_refreshes() {
        assert!(provider_supports_refresh(Provider::GoogleAds));
        assert!(!provider_supports_refresh(Provider::Meta));
        assert!(!provider_supports_refresh(Provider::Shopify));
    }

    #[test]
    fn shopify_needs_shop_domain() {
        let err = require_shop(&ExchangeExtra::default()).unwrap_err();
        assert!(matches!(err, OAuthError::InvalidRequest(_)));
    }
}
