//! Shared HTTP plumbing: client construction and status classification.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use ideaforge_shared::{IdeaForgeError, Result};

/// User-Agent string for provider requests.
pub(crate) const USER_AGENT: &str = concat!("IdeaForge/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error body echoed into error messages.
const MAX_ERROR_BODY: usize = 300;

/// Build a reqwest client with a bounded per-request timeout.
pub(crate) fn build_client(provider: &str, timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| {
            IdeaForgeError::permanent(provider, format!("failed to build HTTP client: {e}"))
        })
}

/// Map an HTTP status to a typed provider error.
///
/// 408, 425, 429 and 5xx are transient; every other non-success status is
/// permanent.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> IdeaForgeError {
    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("HTTP {status}: {snippet}");

    let transient = status.is_server_error() || matches!(status.as_u16(), 408 | 425 | 429);

    if transient {
        IdeaForgeError::transient(provider, message)
    } else {
        IdeaForgeError::permanent(provider, message)
    }
}

/// Map a send/receive failure. Transport errors and timeouts are retryable.
pub(crate) fn transport_error(provider: &str, url: &str, err: reqwest::Error) -> IdeaForgeError {
    if err.is_builder() {
        IdeaForgeError::permanent(provider, format!("{url}: {err}"))
    } else {
        IdeaForgeError::transient(provider, format!("{url}: {err}"))
    }
}

/// Read the body of a response, failing on non-success statuses, and decode it.
pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    url: &str,
    response: Response,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, url, e))?;

    if !status.is_success() {
        return Err(classify_status(provider, status, &body));
    }

    serde_json::from_str(&body).map_err(|e| {
        IdeaForgeError::malformed(format!("{provider} returned an undecodable body: {e}"))
    })
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
