//! Meta (Facebook) OAuth: short-lived code exchange followed by a
//! long-lived token exchange. There is no refresh grant; once the long-lived
//! token expires the user must consent again.

use chrono::{Duration, Utc};
use serde::Deserialize;
use url::Url;

use super::http::{read_json, transport_error};
use super::{AccountIdentity, OAuthError, TokenGrant};
use crate::config::AppConfig;
use crate::models::Provider;

pub const GRAPH_VERSION: &str = "v18.0";
pub const ADS_SCOPE: &str = "ads_read";
/// Lifetime Meta documents for long-lived user tokens.
const LONG_LIVED_FALLBACK_DAYS: i64 = 60;

#[derive(Debug, Clone)]
pub struct MetaOAuth {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    redirect_uri: String,
    dialog_base: String,
    graph_base: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AdAccounts {
    #[serde(default)]
    data: Vec<AdAccount>,
}

#[derive(Debug, Deserialize)]
struct AdAccount {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl MetaOAuth {
    pub fn from_config(http: reqwest::Client, config: &AppConfig) -> Result<Self, OAuthError> {
        let missing = |setting| OAuthError::NotConfigured {
            provider: Provider::Meta,
            setting,
        };
        Ok(Self {
            http,
            app_id: config
                .meta_app_id
                .clone()
                .ok_or_else(|| missing("ADSYNC_META_APP_ID"))?,
            app_secret: config
                .meta_app_secret
                .clone()
                .ok_or_else(|| missing("ADSYNC_META_APP_SECRET"))?,
            redirect_uri: config
                .meta_redirect_uri
                .clone()
                .ok_or_else(|| missing("ADSYNC_META_REDIRECT_URI"))?,
            dialog_base: config.meta_dialog_base.trim_end_matches('/').to_string(),
            graph_base: config.meta_graph_base.trim_end_matches('/').to_string(),
        })
    }

    fn token_endpoint(&self) -> String {
        format!("{}/{GRAPH_VERSION}/oauth/access_token", self.graph_base)
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, OAuthError> {
        Url::parse_with_params(
            &format!("{}/{GRAPH_VERSION}/dialog/oauth", self.dialog_base),
            &[
                ("client_id", self.app_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", ADS_SCOPE),
                ("response_type", "code"),
                ("state", state),
            ],
        )
        .map_err(|e| OAuthError::InvalidRequest(format!("authorize url: {e}")))
    }

    /// Exchanges the code, then trades the short-lived token for a long-lived one.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, OAuthError> {
        let response = self
            .http
            .get(self.token_endpoint())
            .query(&[
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| transport_error(Provider::Meta, e))?;
        let short_lived: TokenResponse = read_json(Provider::Meta, response).await?;

        self.exchange_long_lived(&short_lived.access_token).await
    }

    pub async fn exchange_long_lived(&self, short_lived: &str) -> Result<TokenGrant, OAuthError> {
        let response = self
            .http
            .get(self.token_endpoint())
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("fb_exchange_token", short_lived),
            ])
            .send()
            .await
            .map_err(|e| transport_error(Provider::Meta, e))?;
        let long_lived: TokenResponse = read_json(Provider::Meta, response).await?;

        let lifetime = long_lived
            .expires_in
            .map(Duration::seconds)
            .unwrap_or_else(|| Duration::days(LONG_LIVED_FALLBACK_DAYS));
        Ok(TokenGrant {
            access_token: long_lived.access_token,
            refresh_token: None,
            expires_at: Some(Utc::now() + lifetime),
        })
    }

    /// First ad account (`act_…`) visible to the token.
    pub async fn discover_account(&self, access_token: &str) -> Result<AccountIdentity, OAuthError> {
        let response = self
            .http
            .get(format!("{}/{GRAPH_VERSION}/me/adaccounts", self.graph_base))
            .query(&[("fields", "id,name"), ("access_token", access_token)])
            .send()
            .await
            .map_err(|e| transport_error(Provider::Meta, e))?;
        let accounts: AdAccounts = read_json(Provider::Meta, response).await?;

        let account = accounts
            .data
            .into_iter()
            .next()
            .ok_or_else(|| OAuthError::MalformedResponse {
                provider: Provider::Meta,
                message: "token has no ad accounts".to_string(),
            })?;
        Ok(AccountIdentity {
            external_account_id: account.id,
            external_account_name: account.name,
        })
    }
}
