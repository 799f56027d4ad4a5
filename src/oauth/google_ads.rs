//! Google Ads OAuth: authorization-code grant with offline refresh tokens.
//!
//! Google only issues a refresh token on the first consent unless the user is
//! re-prompted, so the authorize URL always forces `prompt=consent`.

use chrono::{Duration, Utc};
use serde::Deserialize;
use url::Url;

use super::http::{read_json, transport_error};
use super::{AccountIdentity, OAuthError, RefreshedToken, TokenGrant};
use crate::config::AppConfig;
use crate::models::Provider;

pub const ADWORDS_SCOPE: &str = "https://www.googleapis.com/auth/adwords";
pub const API_VERSION: &str = "v17";

#[derive(Debug, Clone)]
pub struct GoogleAdsOAuth {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    developer_token: String,
    authorize_url: String,
    token_url: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessibleCustomers {
    #[serde(default)]
    resource_names: Vec<String>,
}

impl GoogleAdsOAuth {
    pub fn from_config(http: reqwest::Client, config: &AppConfig) -> Result<Self, OAuthError> {
        let missing = |setting| OAuthError::NotConfigured {
            provider: Provider::GoogleAds,
            setting,
        };
        Ok(Self {
            http,
            client_id: config
                .google_ads_client_id
                .clone()
                .ok_or_else(|| missing("ADSYNC_GOOGLE_ADS_CLIENT_ID"))?,
            client_secret: config
                .google_ads_client_secret
                .clone()
                .ok_or_else(|| missing("ADSYNC_GOOGLE_ADS_CLIENT_SECRET"))?,
            redirect_uri: config
                .google_ads_redirect_uri
                .clone()
                .ok_or_else(|| missing("ADSYNC_GOOGLE_ADS_REDIRECT_URI"))?,
            developer_token: config
                .google_ads_developer_token
                .clone()
                .ok_or_else(|| missing("ADSYNC_GOOGLE_ADS_DEVELOPER_TOKEN"))?,
            authorize_url: config.google_authorize_url.clone(),
            token_url: format!("{}/token", config.google_oauth_base.trim_end_matches('/')),
            api_base: config.google_ads_api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, OAuthError> {
        Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", ADWORDS_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| OAuthError::InvalidRequest(format!("authorize url: {e}")))
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, OAuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(Provider::GoogleAds, e))?;

        let token: TokenResponse = read_json(Provider::GoogleAds, response).await?;
        if token.refresh_token.is_none() {
            tracing::warn!("google ads exchange returned no refresh token; access will lapse at expiry");
        }
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, OAuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(Provider::GoogleAds, e))?;

        let token: TokenResponse = read_json(Provider::GoogleAds, response).await?;
        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    /// First customer the token can reach; its id becomes the external account id.
    pub async fn discover_account(&self, access_token: &str) -> Result<AccountIdentity, OAuthError> {
        let response = self
            .http
            .get(format!(
                "{}/{API_VERSION}/customers:listAccessibleCustomers",
                self.api_base
            ))
            .bearer_auth(access_token)
            .header("developer-token", &self.developer_token)
            .send()
            .await
            .map_err(|e| transport_error(Provider::GoogleAds, e))?;

        let customers: AccessibleCustomers = read_json(Provider::GoogleAds, response).await?;
        let customer_id = customers
            .resource_names
            .first()
            .and_then(|name| name.strip_prefix("customers/"))
            .ok_or_else(|| OAuthError::MalformedResponse {
                provider: Provider::GoogleAds,
                message: "no accessible customers".to_string(),
            })?;

        Ok(AccountIdentity {
            external_account_id: customer_id.to_string(),
            external_account_name: Some(format!("Google Ads {customer_id}")),
        })
    }

    pub fn developer_token(&self) -> &str {
        &self.developer_token
    }
}
