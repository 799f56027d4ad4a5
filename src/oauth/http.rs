//! Response handling shared by the token endpoints.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::OAuthError;
use crate::models::Provider;

const BODY_SNIPPET_CHARS: usize = 200;

pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> OAuthError {
    OAuthError::ProviderUnavailable {
        provider,
        message: err.to_string(),
    }
}

/// Reads a token endpoint response, classifying failures.
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: Provider,
    response: reqwest::Response,
) -> Result<T, OAuthError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;

    if !status.is_success() {
        return Err(classify_failure(provider, status, &body));
    }

    serde_json::from_str(&body).map_err(|e| OAuthError::MalformedResponse {
        provider,
        message: e.to_string(),
    })
}

/// `invalid_grant` (OAuth 2.0) and Graph error 190 mean the grant is dead.
pub(crate) fn classify_failure(provider: Provider, status: StatusCode, body: &str) -> OAuthError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let grant_revoked = parsed.as_ref().is_some_and(|value| {
        value.get("error").and_then(Value::as_str) == Some("invalid_grant")
            || value.pointer("/error/code").and_then(Value::as_i64) == Some(190)
    });

    if grant_revoked {
        return OAuthError::ReauthRequired {
            provider,
            reason: snippet(body),
        };
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return OAuthError::ProviderUnavailable {
            provider,
            message: format!("status {status}"),
        };
    }

    OAuthError::ProviderRejected {
        provider,
        status: status.as_u16(),
        body: snippet(body),
    }
}

fn snippet(body: &str) -> String {
    if body.chars().count() > BODY_SNIPPET_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_requires_reauth() {
        let err = classify_failure(
            Provider::GoogleAds,
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        assert!(err.requires_reauth());
    }

    #[test]
    fn graph_code_190_requires_reauth() {
        let err = classify_failure(
            Provider::Meta,
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"Session has expired","type":"OAuthException","code":190}}"#,
        );
        assert!(matches!(err, OAuthError::ReauthRequired { .. }));
    }

    #[test]
    fn server_errors_are_unavailable_and_others_rejected() {
        assert!(matches!(
            classify_failure(Provider::Shopify, StatusCode::BAD_GATEWAY, "oops"),
            OAuthError::ProviderUnavailable { .. }
        ));
        assert!(matches!(
            classify_failure(Provider::Shopify, StatusCode::BAD_REQUEST, &"x".repeat(500)),
            OAuthError::ProviderRejected { status: 400, ref body, .. } if body.len() == 203
        ));
    }
}
