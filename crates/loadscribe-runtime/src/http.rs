//! Shared HTTP plumbing for collectors, the wiki client and providers.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Length of the response-body excerpt kept in logs and errors.
pub const SNIPPET_LEN: usize = 200;

/// A non-2xx response from a backend.
#[derive(Debug, Clone, Error)]
#[error("{target} returned HTTP {status}: {snippet}")]
pub struct StatusError {
    pub target: String,
    pub status: u16,
    pub snippet: String,
}

/// Build a client with a per-request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    build_client_with(timeout, true)
}

/// Build a client, optionally accepting certificates that fail verification.
///
/// Only the GigaChat endpoints need `verify_tls = false`; their chain is
/// signed by a root most trust stores lack.
pub fn build_client_with(
    timeout: Duration,
    verify_tls: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .build()
}

/// First [`SNIPPET_LEN`] characters of a body, on a char boundary.
pub fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_LEN).collect()
}

/// Pass a successful response through; log and convert anything else.
pub async fn check_status(
    response: reqwest::Response,
    target: &str,
) -> Result<reqwest::Response, StatusError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let snippet = snippet(&body);
    warn!(target_name = target, status = status.as_u16(), body = %snippet, "Backend returned an error");

    Err(StatusError {
        target: target.to_string(),
        status: status.as_u16(),
        snippet,
    })
}
