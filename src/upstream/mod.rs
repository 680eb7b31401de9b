//! Thin authenticated request/response wrappers over the two upstream
//! control planes.
//!
//! Both clients share one request path: take a fresh token from the
//! [`TokenManager`], send, and classify the outcome. Transport failures
//! become [`UpstreamError::Unavailable`] and are retried a bounded number
//! of times; non-2xx responses become [`UpstreamError::Rejected`] and are
//! not — except a single retry after a forced token refresh when the
//! status is 401/403. Responses are never cached here.

pub mod infisical;
pub mod portainer;

pub use infisical::InfisicalClient;
pub use portainer::PortainerClient;

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use crate::auth::{Authority, TokenManager};
use crate::error::UpstreamError;

/// Extra attempts after a transport-level failure.
const TRANSIENT_RETRIES: u32 = 2;
/// Pause between transport retries.
const RETRY_PAUSE: Duration = Duration::from_millis(250);
/// Error bodies are truncated to this many bytes in error values and logs.
const ERROR_BODY_PREVIEW: usize = 512;

/// A successful upstream response.
///
/// Some endpoints answer 2xx with a plain-text body; those surface as
/// `Text` instead of failing JSON parsing.
#[derive(Debug, Clone)]
pub enum ApiPayload {
    Json(Value),
    Text(String),
}

impl ApiPayload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}

fn parse_payload(text: &str) -> ApiPayload {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => ApiPayload::Json(value),
        Err(_) => ApiPayload::Text(text.to_string()),
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= ERROR_BODY_PREVIEW {
        return body.to_string();
    }
    let mut cut = ERROR_BODY_PREVIEW;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &body[..cut])
}

/// Send one authenticated request with retry handling.
///
/// `body` is only attached for non-GET methods, mirroring the upstream
/// APIs' expectations.
pub(crate) async fn call(
    client: &reqwest::Client,
    tokens: &TokenManager,
    authority: Authority,
    method: Method,
    url: reqwest::Url,
    body: Option<&Value>,
) -> Result<ApiPayload, UpstreamError> {
    let mut refreshed = false;
    let mut transient_left = TRANSIENT_RETRIES;

    loop {
        match call_once(client, tokens, authority, method.clone(), url.clone(), body).await {
            Ok(payload) => return Ok(payload),
            Err(UpstreamError::Rejected { status, body: _ }) if !refreshed && (status == 401 || status == 403) => {
                refreshed = true;
                tracing::debug!(%authority, status, "auth rejected, forcing token refresh");
                tokens.force_refresh(authority).await;
            }
            Err(err) if err.is_transient() && transient_left > 0 => {
                transient_left -= 1;
                tracing::warn!(%authority, error = %err, retries_left = transient_left, "transient upstream failure, retrying");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn call_once(
    client: &reqwest::Client,
    tokens: &TokenManager,
    authority: Authority,
    method: Method,
    url: reqwest::Url,
    body: Option<&Value>,
) -> Result<ApiPayload, UpstreamError> {
    let token = tokens.ensure_token(authority).await?;

    let mut request = client
        .request(method.clone(), url.clone())
        .header("Authorization", format!("Bearer {}", token));
    if method != Method::GET {
        if let Some(body) = body {
            request = request.json(body);
        }
    }

    tracing::debug!(%authority, %method, url = %url, "upstream request");

    let response = request.send().await.map_err(|e| UpstreamError::Unavailable {
        reason: e.to_string(),
    })?;

    let status = response.status();
    let text = response.text().await.map_err(|e| UpstreamError::Unavailable {
        reason: format!("failed to read response body: {}", e),
    })?;

    if !status.is_success() {
        return Err(UpstreamError::Rejected {
            status: status.as_u16(),
            body: truncate_body(&text),
        });
    }

    Ok(parse_payload(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_json() {
        match parse_payload(r#"{"jwt": "abc"}"#) {
            ApiPayload::Json(value) => assert_eq!(value["jwt"], "abc"),
            ApiPayload::Text(_) => panic!("expected json"),
        }
    }

    #[test]
    fn test_parse_payload_plain_text() {
        match parse_payload("Test endpoint is working!") {
            ApiPayload::Text(text) => assert_eq!(text, "Test endpoint is working!"),
            ApiPayload::Json(_) => panic!("expected text"),
        }
    }

    #[test]
    fn test_truncate_body_limits_length() {
        let long = "x".repeat(2048);
        let truncated = truncate_body(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with('…'));
        assert_eq!(truncate_body("short"), "short");
    }
}
