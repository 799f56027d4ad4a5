//! Shopify OAuth: one exchange yields a non-expiring offline token.
//!
//! Callbacks carry an `hmac` query parameter signed with the app secret; it
//! is verified before the code is exchanged.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use url::Url;

use super::http::{read_json, transport_error};
use super::{AccountIdentity, OAuthError, TokenGrant};
use crate::config::AppConfig;
use crate::models::Provider;

pub const ADMIN_API_VERSION: &str = "2024-01";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ShopifyOAuth {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    redirect_uri: String,
    scopes: String,
    api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ShopEnvelope {
    shop: Shop,
}

#[derive(Debug, Deserialize)]
struct Shop {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    myshopify_domain: Option<String>,
}

const SHOP_DOMAIN_PATTERN: &str = r"^[a-z0-9][a-z0-9\-]*\.myshopify\.com$";

/// Validates and lowercases a `{shop}.myshopify.com` domain.
pub fn normalize_shop_domain(shop: &str) -> Result<String, OAuthError> {
    let shop = shop.trim().to_ascii_lowercase();
    let pattern = Regex::new(SHOP_DOMAIN_PATTERN)
        .map_err(|e| OAuthError::InvalidRequest(format!("shop pattern: {e}")))?;
    if pattern.is_match(&shop) {
        Ok(shop)
    } else {
        Err(OAuthError::InvalidRequest(format!(
            "'{shop}' is not a myshopify.com domain"
        )))
    }
}

/// Base URL for a shop's API, honoring a configured override.
pub fn shop_base_url(api_base: Option<&str>, shop: &str) -> String {
    match api_base {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => format!("https://{shop}"),
    }
}

impl ShopifyOAuth {
    pub fn from_config(http: reqwest::Client, config: &AppConfig) -> Result<Self, OAuthError> {
        let missing = |setting| OAuthError::NotConfigured {
            provider: Provider::Shopify,
            setting,
        };
        Ok(Self {
            http,
            api_key: config
                .shopify_api_key
                .clone()
                .ok_or_else(|| missing("ADSYNC_SHOPIFY_API_KEY"))?,
            api_secret: config
                .shopify_api_secret
                .clone()
                .ok_or_else(|| missing("ADSYNC_SHOPIFY_API_SECRET"))?,
            redirect_uri: config
                .shopify_redirect_uri
                .clone()
                .ok_or_else(|| missing("ADSYNC_SHOPIFY_REDIRECT_URI"))?,
            scopes: config.shopify_scopes.clone(),
            api_base: config.shopify_api_base.clone(),
        })
    }

    fn base_url(&self, shop: &str) -> String {
        shop_base_url(self.api_base.as_deref(), shop)
    }

    pub fn authorize_url(&self, shop: &str, state: &str) -> Result<Url, OAuthError> {
        let shop = normalize_shop_domain(shop)?;
        Url::parse_with_params(
            &format!("https://{shop}/admin/oauth/authorize"),
            &[
                ("client_id", self.api_key.as_str()),
                ("scope", self.scopes.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| OAuthError::InvalidRequest(format!("authorize url: {e}")))
    }

    /// Checks the callback's `hmac` against every other query parameter.
    pub fn verify_callback(&self, params: &BTreeMap<String, String>) -> Result<(), OAuthError> {
        verify_hmac(&self.api_secret, params)
    }

    pub async fn exchange_code(&self, shop: &str, code: &str) -> Result<TokenGrant, OAuthError> {
        let shop = normalize_shop_domain(shop)?;
        let response = self
            .http
            .post(format!("{}/admin/oauth/access_token", self.base_url(&shop)))
            .json(&json!({
                "client_id": self.api_key,
                "client_secret": self.api_secret,
                "code": code,
            }))
            .send()
            .await
            .map_err(|e| transport_error(Provider::Shopify, e))?;
        let token: TokenResponse = read_json(Provider::Shopify, response).await?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: None,
            expires_at: None,
        })
    }

    pub async fn discover_account(
        &self,
        shop: &str,
        access_token: &str,
    ) -> Result<AccountIdentity, OAuthError> {
        let shop = normalize_shop_domain(shop)?;
        let response = self
            .http
            .get(format!(
                "{}/admin/api/{ADMIN_API_VERSION}/shop.json",
                self.base_url(&shop)
            ))
            .header("X-Shopify-Access-Token", access_token)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Shopify, e))?;
        let envelope: ShopEnvelope = read_json(Provider::Shopify, response).await?;

        Ok(AccountIdentity {
            external_account_id: envelope.shop.myshopify_domain.unwrap_or(shop),
            external_account_name: envelope.shop.name,
        })
    }
}

pub(crate) fn verify_hmac(secret: &str, params: &BTreeMap<String, String>) -> Result<(), OAuthError> {
    let provided = params
        .get("hmac")
        .ok_or_else(|| OAuthError::InvalidRequest("callback is missing hmac".to_string()))?;
    let provided = hex::decode(provided)
        .map_err(|_| OAuthError::InvalidRequest("callback hmac is not hex".to_string()))?;

    // BTreeMap iteration is already sorted by key.
    let message = params
        .iter()
        .filter(|(key, _)| key.as_str() != "hmac" && key.as_str() != "signature")
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| OAuthError::InvalidRequest(format!("hmac key: {e}")))?;
    mac.update(message.as_bytes());
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(&provided).into() {
        Ok(())
    } else {
        Err(OAuthError::InvalidRequest(
            "callback hmac does not match".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_only_myshopify_domains() {
        assert_eq!(
            normalize_shop_domain(" Demo-Store.myshopify.com ").unwrap(),
            "demo-store.myshopify.com"
        );
        assert!(normalize_shop_domain("evil.com").is_err());
        assert!(normalize_shop_domain("demo.myshopify.com.evil.com").is_err());
    }

    #[test]
    fn verifies_sorted_parameter_signature() {
        let mut params = BTreeMap::new();
        params.insert("shop".to_string(), "demo.myshopify.com".to_string());
        params.insert("code".to_string(), "abc".to_string());
        params.insert("timestamp".to_string(), "1700000000".to_string());
        params.insert("state".to_string(), "tenant".to_string());
        let hmac = sign(
            "secret",
            "code=abc&shop=demo.myshopify.com&state=tenant&timestamp=1700000000",
        );
        params.insert("hmac".to_string(), hmac);

        assert!(verify_hmac("secret", &params).is_ok());
        assert!(verify_hmac("other-secret", &params).is_err());

        params.insert("code".to_string(), "tampered".to_string());
        assert!(verify_hmac("secret", &params).is_err());
    }

    #[test]
    fn missing_hmac_is_rejected() {
        let params = BTreeMap::new();
        assert!(matches!(
            verify_hmac("secret", &params),
            Err(OAuthError::InvalidRequest(_))
        ));
    }

    #[test]
    fn base_url_override_wins() {
        assert_eq!(
            shop_base_url(Some("http://127.0.0.1:9000/"), "demo.myshopify.com"),
            "http://127.0.0.1:9000"
        );
        assert_eq!(
            shop_base_url(None, "demo.myshopify.com"),
            "https://demo.myshopify.com"
        );
    }
}
