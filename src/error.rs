//! # Error Handling
//!
//! `ApiError` is the only error type that crosses the HTTP boundary. It
//! renders as `application/problem+json` carrying a stable code and the
//! request's trace id. Library errors convert into it here and nowhere else.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::oauth::OAuthError;
use crate::queue::QueueError;
use crate::repositories::{RepositoryError, is_unique_violation};
use crate::scheduler::SchedulerError;
use crate::telemetry;

const BODY_SNIPPET_CHARS: usize = 200;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
            retry_after: None,
            trace_id: telemetry::current_trace_id().map(String::into_boxed_str),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(retry_after) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

pub fn not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn validation_error(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
}

fn internal(message: &str) -> ApiError {
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_SERVER_ERROR",
        message,
    )
}

/// Upstream provider failure, body truncated on a char boundary.
pub fn provider_error(provider: &str, status: u16, body: Option<&str>) -> ApiError {
    let snippet = body.map(|b| {
        if b.chars().count() > BODY_SNIPPET_CHARS {
            format!("{}...", b.chars().take(BODY_SNIPPET_CHARS).collect::<String>())
        } else {
            b.to_string()
        }
    });
    ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR",
        &format!("Provider {provider} returned error status {status}"),
    )
    .with_details(json!({
        "provider": provider,
        "status": status,
        "body_snippet": snippet,
    }))
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("internal error: {:?}", error);
        internal("An internal error occurred")
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            return ApiError::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }
        match error {
            sea_orm::DbErr::RecordNotFound(record) => not_found(&format!("Record not found: {record}")),
            sea_orm::DbErr::Conn(err) => {
                tracing::error!("database connection error: {:?}", err);
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("database error: {:?}", other);
                internal("Database error occurred")
            }
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(err) => err.into(),
            RepositoryError::IntegrationNotFound(id) => {
                not_found(&format!("Integration {id} not found"))
            }
            RepositoryError::Crypto(err) => {
                tracing::error!(error = %err, "credential decryption failed");
                internal("Stored credentials could not be read")
            }
            RepositoryError::InvalidValue(err) => {
                tracing::error!(error = %err, "unexpected stored value");
                internal("Stored record is invalid")
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Database(err) => err.into(),
            QueueError::DuplicateJob { dedupe_key } => ApiError::new(
                StatusCode::CONFLICT,
                "DUPLICATE_JOB",
                &format!("A job with key '{dedupe_key}' is already waiting or active"),
            ),
            QueueError::InvalidSchedule { .. } | QueueError::InvalidPayload(_) => {
                validation_error(&error.to_string())
            }
            QueueError::JobNotFound(id) => not_found(&format!("Job {id} not found")),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::Queue(err) => err.into(),
            SchedulerError::Repository(err) => err.into(),
            SchedulerError::IntegrationInactive(id) => ApiError::new(
                StatusCode::CONFLICT,
                "INTEGRATION_INACTIVE",
                &format!("Integration {id} is disconnected; re-authorize it first"),
            ),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(error: OAuthError) -> Self {
        let message = error.to_string();
        match error {
            OAuthError::Unsupported { .. }
            | OAuthError::InvalidRequest(_)
            | OAuthError::InvalidValue(_) => validation_error(&message),
            OAuthError::ReauthRequired { .. } => {
                ApiError::new(StatusCode::UNAUTHORIZED, "REAUTH_REQUIRED", &message)
            }
            OAuthError::ProviderUnavailable { .. } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "PROVIDER_UNAVAILABLE",
                &message,
            ),
            OAuthError::ProviderRejected {
                provider,
                status,
                body,
            } => provider_error(provider.as_str(), status, Some(&body)),
            OAuthError::MalformedResponse { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", &message)
            }
            OAuthError::NotConfigured { .. } => ApiError::new(
                StatusCode::NOT_IMPLEMENTED,
                "PROVIDER_NOT_CONFIGURED",
                &message,
            ),
            OAuthError::Storage(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;
    use uuid::Uuid;

    #[test]
    fn problem_json_with_retry_after() {
        let response = ApiError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "slow down")
            .with_retry_after(60)
            .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
    }

    #[test]
    fn provider_body_is_truncated() {
        let body = "é".repeat(250);
        let error = provider_error("meta", 400, Some(&body));
        let details = error.details.unwrap();
        let snippet = details["body_snippet"].as_str().unwrap();
        assert_eq!(snippet.chars().count(), BODY_SNIPPET_CHARS + 3);
        assert!(snippet.ends_with("..."));
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn duplicate_job_is_conflict() {
        let error: ApiError = QueueError::DuplicateJob {
            dedupe_key: "recurring-sync-all".into(),
        }
        .into();
        assert_eq!(error.status, StatusCode::CONFLICT);
        assert_eq!(&*error.code, "DUPLICATE_JOB");
    }

    #[test]
    fn missing_integration_is_not_found() {
        let error: ApiError = RepositoryError::IntegrationNotFound(Uuid::nil()).into();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn oauth_errors_map_to_statuses() {
        let reauth: ApiError = OAuthError::ReauthRequired {
            provider: Provider::Meta,
            reason: "expired".into(),
        }
        .into();
        assert_eq!(reauth.status, StatusCode::UNAUTHORIZED);

        let unconfigured: ApiError = OAuthError::NotConfigured {
            provider: Provider::Shopify,
            setting: "ADSYNC_SHOPIFY_API_KEY",
        }
        .into();
        assert_eq!(&*unconfigured.code, "PROVIDER_NOT_CONFIGURED");

        let inactive: ApiError = SchedulerError::IntegrationInactive(Uuid::nil()).into();
        assert_eq!(inactive.status, StatusCode::CONFLICT);
    }
}
