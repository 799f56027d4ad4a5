//! Status classification shared by the provider read APIs.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::SyncError;
use crate::models::Provider;

const BODY_SNIPPET_CHARS: usize = 300;

/// A response whose body has been read in full.
#[derive(Debug)]
pub(crate) struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Fetched {
    pub fn parse<T: DeserializeOwned>(&self, provider: Provider) -> Result<T, SyncError> {
        serde_json::from_str(&self.body).map_err(|e| {
            SyncError::malformed(format!("{provider} response did not parse: {e}"))
                .with_details(serde_json::json!({ "body": snippet(&self.body) }))
        })
    }
}

/// Sends the request and reads the body. Only transport failures are errors
/// here; status handling is left to the caller.
pub(crate) async fn fetch(provider: Provider, request: RequestBuilder) -> Result<Fetched, SyncError> {
    let response = request.send().await.map_err(|e| transport(provider, e))?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(|e| transport(provider, e))?;
    Ok(Fetched {
        status,
        headers,
        body,
    })
}

/// `fetch` followed by the default status classification.
pub(crate) async fn fetch_ok(provider: Provider, request: RequestBuilder) -> Result<Fetched, SyncError> {
    let fetched = fetch(provider, request).await?;
    if fetched.status.is_success() {
        Ok(fetched)
    } else {
        Err(classify_status(provider, &fetched))
    }
}

fn transport(provider: Provider, err: reqwest::Error) -> SyncError {
    let what = if err.is_timeout() { "timed out" } else { "unreachable" };
    SyncError::unavailable(format!("{provider} {what}: {err}"))
}

pub(crate) fn classify_status(provider: Provider, fetched: &Fetched) -> SyncError {
    let status = fetched.status;
    let details = serde_json::json!({
        "status": status.as_u16(),
        "body": snippet(&fetched.body),
    });
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::auth_expired(format!("{provider} rejected the credential ({status})"))
        }
        StatusCode::TOO_MANY_REQUESTS => SyncError::rate_limited(
            retry_after_secs(&fetched.headers),
            format!("{provider} rate limit"),
        ),
        s if s.is_server_error() => {
            SyncError::unavailable(format!("{provider} returned {status}"))
        }
        _ => SyncError::malformed(format!("{provider} returned unexpected {status}")),
    };
    err.with_details(details)
}

/// Delta-seconds form of `Retry-After`; HTTP-date values are ignored.
pub(crate) fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}
