//! Uniform token surface over the provider flows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::flow::provider_supports_refresh;
use super::{ExchangeExtra, OAuthError, RefreshedToken, TokenFlow, TokenGrant};
use crate::config::AppConfig;
use crate::models::{Provider, integration};
use crate::repositories::{IntegrationRepository, StoredCredentials};

/// Exchanges codes, refreshes tokens and hands out usable access tokens.
///
/// Refreshes of one integration are single-flight within the process; across
/// processes the `credential_version` compare-and-set decides the winner and
/// the loser adopts the stored token.
#[derive(Clone)]
pub struct TokenManager {
    flows: Arc<HashMap<Provider, TokenFlow>>,
    integrations: Arc<IntegrationRepository>,
    refresh_margin: Duration,
    refresh_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("providers", &self.flows.keys().collect::<Vec<_>>())
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}

impl TokenManager {
    pub fn new(integrations: Arc<IntegrationRepository>, refresh_margin: Duration) -> Self {
        Self {
            flows: Arc::new(HashMap::new()),
            integrations,
            refresh_margin,
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_flow(mut self, flow: TokenFlow) -> Self {
        Arc::make_mut(&mut self.flows).insert(flow.provider(), flow);
        self
    }

    /// Registers a flow for every provider whose credentials are configured.
    pub fn from_config(
        config: &AppConfig,
        integrations: Arc<IntegrationRepository>,
    ) -> Result<Self, OAuthError> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.token.http_timeout_seconds))
            .build()
            .map_err(|e| OAuthError::InvalidRequest(format!("http client: {e}")))?;

        let margin = Duration::seconds(config.token.refresh_margin_seconds as i64);
        let mut manager = Self::new(integrations, margin);
        for provider in Provider::ALL {
            match TokenFlow::from_config(provider, http.clone(), config) {
                Ok(flow) => manager = manager.with_flow(flow),
                Err(OAuthError::NotConfigured { setting, .. }) => {
                    debug!(%provider, setting, "provider not configured; oauth disabled");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(manager)
    }

    pub fn flow(&self, provider: Provider) -> Result<&TokenFlow, OAuthError> {
        self.flows.get(&provider).ok_or(OAuthError::NotConfigured {
            provider,
            setting: "oauth client credentials",
        })
    }

    pub fn authorize_url(
        &self,
        provider: Provider,
        state: &str,
        extra: &ExchangeExtra,
    ) -> Result<Url, OAuthError> {
        self.flow(provider)?.authorize_url(state, extra)
    }

    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        extra: &ExchangeExtra,
    ) -> Result<TokenGrant, OAuthError> {
        self.flow(provider)?.exchange_code(code, extra).await
    }

    /// Fails with [`OAuthError::Unsupported`] for providers without a refresh grant.
    pub async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<RefreshedToken, OAuthError> {
        if !provider_supports_refresh(provider) {
            return Err(OAuthError::Unsupported { provider });
        }
        let result = self.flow(provider)?.refresh(refresh_token).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!(
            "adsync_token_refresh_total",
            "provider" => provider.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        result
    }

    /// Completes an OAuth callback: exchange, account discovery, persistence.
    #[instrument(skip(self, code, extra), fields(%tenant_id, %provider))]
    pub async fn connect(
        &self,
        tenant_id: Uuid,
        provider: Provider,
        code: &str,
        extra: &ExchangeExtra,
    ) -> Result<integration::Model, OAuthError> {
        let flow = self.flow(provider)?;
        let grant = flow.exchange_code(code, extra).await?;
        let account = flow.discover_account(&grant.access_token, extra).await?;
        let model = self
            .integrations
            .upsert_from_grant(tenant_id, provider, &account, &grant)
            .await?;
        info!(integration_id = %model.id, "oauth connect completed");
        Ok(model)
    }

    fn needs_refresh(&self, credentials: &StoredCredentials) -> bool {
        credentials
            .expires_at
            .is_some_and(|at| at - self.refresh_margin <= Utc::now())
    }

    async fn refresh_lock(&self, integration_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(integration_id).or_default().clone()
    }

    /// Drops the per-integration lock once no other resolve is holding or
    /// waiting on it.
    async fn release_refresh_lock(&self, integration_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.refresh_locks.lock().await;
        drop(lock);
        if locks
            .get(&integration_id)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            locks.remove(&integration_id);
        }
    }

    /// Integrations with a refresh in flight or queued in this process.
    pub async fn refreshes_in_flight(&self) -> usize {
        self.refresh_locks.lock().await.len()
    }

    /// Returns an access token that is valid for at least the refresh margin,
    /// refreshing and persisting it first when needed.
    #[instrument(skip_all, fields(integration_id = %integration.id, provider = %integration.provider))]
    pub async fn resolve_valid_token(
        &self,
        integration: &integration::Model,
    ) -> Result<String, OAuthError> {
        let provider = integration.provider()?;
        let credentials = self.integrations.decrypt_credentials(integration)?;
        if !self.needs_refresh(&credentials) {
            return Ok(credentials.access_token);
        }

        let expired = credentials.expires_at.is_some_and(|at| at <= Utc::now());
        if !provider_supports_refresh(provider) || credentials.refresh_token.is_none() {
            if expired {
                return Err(OAuthError::ReauthRequired {
                    provider,
                    reason: "access token expired and cannot be refreshed".to_string(),
                });
            }
            warn!(expires_at = ?credentials.expires_at, "token near expiry and not refreshable");
            return Ok(credentials.access_token);
        }

        let lock = self.refresh_lock(integration.id).await;
        let resolved = {
            let _guard = lock.lock().await;
            self.refresh_single_flight(integration, provider).await
        };
        self.release_refresh_lock(integration.id, lock).await;
        resolved
    }

    /// Runs under the integration's refresh lock.
    async fn refresh_single_flight(
        &self,
        integration: &integration::Model,
        provider: Provider,
    ) -> Result<String, OAuthError> {
        // Someone may have refreshed while we waited.
        let current = self.integrations.require(integration.id).await?;
        let credentials = self.integrations.decrypt_credentials(&current)?;
        if !self.needs_refresh(&credentials) {
            return Ok(credentials.access_token);
        }
        let Some(refresh_token) = credentials.refresh_token.as_deref() else {
            return Err(OAuthError::ReauthRequired {
                provider,
                reason: "refresh token missing".to_string(),
            });
        };

        let refreshed = self.refresh(provider, refresh_token).await?;
        let stored = self
            .integrations
            .store_refreshed_token(
                &current,
                credentials.version,
                &refreshed.access_token,
                refreshed.refresh_token.as_deref(),
                refreshed.expires_at,
            )
            .await?;

        if stored {
            info!(expires_at = ?refreshed.expires_at, "access token refreshed");
            return Ok(refreshed.access_token);
        }

        // Another process refreshed first; its token is the one on record.
        debug!("lost refresh race; using stored token");
        let winner = self.integrations.require(integration.id).await?;
        Ok(self.integrations.decrypt_credentials(&winner)?.access_token)
    }
}
