//! Authenticated client for the Infisical-compatible secrets API.

use std::sync::Arc;

use reqwest::{Method, Url};
use serde_json::Value;

use crate::auth::{Authority, TokenManager};
use crate::error::UpstreamError;

pub struct InfisicalClient {
    client: reqwest::Client,
    tokens: Arc<TokenManager>,
    base_url: String,
    organization_id: String,
}

impl InfisicalClient {
    pub fn new(
        client: reqwest::Client,
        tokens: Arc<TokenManager>,
        base_url: String,
        organization_id: String,
    ) -> Self {
        Self {
            client,
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
            organization_id,
        }
    }

    fn url(&self, path: &str) -> Result<Url, UpstreamError> {
        Url::parse(&format!("{}{}", self.base_url, path)).map_err(|e| {
            UpstreamError::Unavailable {
                reason: format!("invalid url for path {}: {}", path, e),
            }
        })
    }

    async fn get_json(&self, url: Url, what: &str) -> Result<Value, UpstreamError> {
        let payload = super::call(
            &self.client,
            &self.tokens,
            Authority::Infisical,
            Method::GET,
            url,
            None,
        )
        .await?;
        payload.into_json().ok_or_else(|| UpstreamError::Rejected {
            status: 200,
            body: format!("{} returned a non-JSON body", what),
        })
    }

    /// List the organization's projects ("workspaces").
    pub async fn list_projects(&self) -> Result<Value, UpstreamError> {
        let url = self.url(&format!(
            "/api/v2/organizations/{}/workspaces",
            self.organization_id
        ))?;
        self.get_json(url, "workspace list").await
    }

    /// List the raw secrets of one project+environment scope.
    pub async fn list_secrets(
        &self,
        workspace_id: &str,
        environment: &str,
    ) -> Result<Value, UpstreamError> {
        let mut url = self.url("/api/v3/secrets/raw")?;
        url.query_pairs_mut()
            .append_pair("workspaceId", workspace_id)
            .append_pair("environment", environment);
        self.get_json(url, "secret list").await
    }
}
