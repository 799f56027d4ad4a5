//! Adapter trait and the error taxonomy the worker reconciles against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Provider, UnknownVariant};
use crate::oauth::OAuthError;
use crate::repositories::RepositoryError;

/// Counts of canonical rows written by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub campaigns_upserted: usize,
    pub metrics_upserted: usize,
}

#[async_trait]
pub trait SyncAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Mirrors the integration's campaigns and metric window into storage.
    /// Safe to re-run over the same dates.
    async fn sync(&self, integration_id: Uuid) -> Result<SyncResult, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Provider rejected the credential
    AuthExpired,
    /// Credential cannot be renewed without the user
    ReauthRequired,
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// 5xx, transport failure or timeout
    ProviderUnavailable,
    /// Response did not match the provider's documented contract
    MalformedResponse,
    /// Local database failure
    Storage,
    /// Provider or integration is not set up to sync
    Configuration,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::AuthExpired => "auth_expired",
            SyncErrorKind::ReauthRequired => "reauth_required",
            SyncErrorKind::RateLimited { .. } => "rate_limited",
            SyncErrorKind::ProviderUnavailable => "provider_unavailable",
            SyncErrorKind::MalformedResponse => "malformed_response",
            SyncErrorKind::Storage => "storage",
            SyncErrorKind::Configuration => "configuration",
        }
    }
}

impl SyncError {
    fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::AuthExpired, message)
    }

    pub fn reauth_required(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::ReauthRequired, message)
    }

    pub fn rate_limited(retry_after_secs: Option<u64>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::RateLimited { retry_after_secs }, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::ProviderUnavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::MalformedResponse, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Storage, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Configuration, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Transient kinds go back through the backoff policy; the rest are
    /// terminal for the job. `Storage` is a failure of our own database and
    /// says nothing about the provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::RateLimited { .. }
                | SyncErrorKind::ProviderUnavailable
                | SyncErrorKind::Storage
        )
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::AuthExpired | SyncErrorKind::ReauthRequired
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.kind {
            SyncErrorKind::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        }
    }

    /// JSON stored in `integrations.last_error` and on the failed job.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "type": self.kind.as_str(), "message": self.message })
        })
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let SyncErrorKind::RateLimited {
            retry_after_secs: Some(after),
        } = self.kind
        {
            write!(f, " (retry after: {after}s)")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<OAuthError> for SyncError {
    fn from(err: OAuthError) -> Self {
        let message = err.to_string();
        match err {
            OAuthError::ReauthRequired { .. } | OAuthError::Unsupported { .. } => {
                SyncError::reauth_required(message)
            }
            OAuthError::ProviderUnavailable { .. } => SyncError::unavailable(message),
            OAuthError::ProviderRejected { status, .. } if status == 401 || status == 403 => {
                SyncError::auth_expired(message)
            }
            OAuthError::ProviderRejected { .. } | OAuthError::MalformedResponse { .. } => {
                SyncError::malformed(message)
            }
            OAuthError::NotConfigured { .. }
            | OAuthError::InvalidRequest(_)
            | OAuthError::InvalidValue(_) => SyncError::configuration(message),
            OAuthError::Storage(inner) => inner.into(),
        }
    }
}

impl From<RepositoryError> for SyncError {
    fn from(err: RepositoryError) -> Self {
        let message = err.to_string();
        match err {
            RepositoryError::Database(_) => SyncError::storage(message),
            // A credential that no longer decrypts has to be granted again.
            RepositoryError::Crypto(_) => SyncError::reauth_required(message),
            RepositoryError::IntegrationNotFound(_) | RepositoryError::InvalidValue(_) => {
                SyncError::configuration(message)
            }
        }
    }
}

impl From<UnknownVariant> for SyncError {
    fn from(err: UnknownVariant) -> Self {
        SyncError::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(SyncError::rate_limited(Some(10), "slow down").is_retryable());
        assert!(SyncError::unavailable("502").is_retryable());
        assert!(SyncError::storage("locked").is_retryable());
        assert!(!SyncError::auth_expired("401").is_retryable());
        assert!(!SyncError::reauth_required("expired").is_retryable());
        assert!(!SyncError::malformed("bad json").is_retryable());
        assert!(!SyncError::configuration("missing").is_retryable());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = SyncError::rate_limited(Some(30), "quota").to_json();
        assert_eq!(json["type"], "rate_limited");
        assert_eq!(json["retry_after_secs"], 30);
        assert_eq!(json["message"], "quota");
    }

    #[test]
    fn oauth_errors_map_to_sync_kinds() {
        let reauth: SyncError = OAuthError::ReauthRequired {
            provider: Provider::Meta,
            reason: "expired".into(),
        }
        .into();
        assert_eq!(reauth.kind, SyncErrorKind::ReauthRequired);

        let rejected: SyncError = OAuthError::ProviderRejected {
            provider: Provider::GoogleAds,
            status: 401,
            body: String::new(),
        }
        .into();
        assert_eq!(rejected.kind, SyncErrorKind::AuthExpired);

        let down: SyncError = OAuthError::ProviderUnavailable {
            provider: Provider::GoogleAds,
            message: "timeout".into(),
        }
        .into();
        assert!(down.is_retryable());
    }

    #[test]
    fn display_includes_retry_hint() {
        let err = SyncError::rate_limited(Some(5), "quota");
        assert_eq!(err.to_string(), "rate_limited (retry after: 5s): quota");
    }
}
