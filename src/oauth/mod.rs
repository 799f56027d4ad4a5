//! # OAuth Token Lifecycle
//!
//! Code exchange, refresh and "give me a usable token" for the three providers.
//! Provider differences live in [`TokenFlow`]; callers only see
//! [`TokenManager`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Provider, UnknownVariant};
use crate::repositories::RepositoryError;

pub mod flow;
pub mod google_ads;
mod http;
pub mod manager;
pub mod meta;
pub mod shopify;

pub use flow::TokenFlow;
pub use manager::TokenManager;

/// Credentials returned by an authorization-code exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Credentials returned by a refresh. Some providers rotate the refresh token.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("access_token", &"[REDACTED]")
            .field("rotated_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The provider account a grant belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub external_account_id: String,
    pub external_account_name: Option<String>,
}

/// Provider-specific inputs that travel alongside the authorization code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeExtra {
    /// Shopify shop domain (`{shop}.myshopify.com`)
    pub shop: Option<String>,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{provider} has no refresh flow")]
    Unsupported { provider: Provider },
    #[error("{provider} credentials need re-authorization: {reason}")]
    ReauthRequired { provider: Provider, reason: String },
    #[error("{provider} token endpoint unavailable: {message}")]
    ProviderUnavailable { provider: Provider, message: String },
    #[error("{provider} rejected the request with status {status}: {body}")]
    ProviderRejected {
        provider: Provider,
        status: u16,
        body: String,
    },
    #[error("{provider} returned an unexpected token response: {message}")]
    MalformedResponse { provider: Provider, message: String },
    #[error("{provider} is not configured: missing {setting}")]
    NotConfigured {
        provider: Provider,
        setting: &'static str,
    },
    #[error("invalid oauth request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    InvalidValue(#[from] UnknownVariant),
    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

impl OAuthError {
    /// True when the user has to go through the consent screen again.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            OAuthError::ReauthRequired { .. } | OAuthError::Unsupported { .. }
        )
    }
}
