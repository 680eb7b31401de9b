//! Authenticated client for the Portainer-compatible orchestration API.

use std::sync::Arc;

use reqwest::{Method, Url};
use serde_json::{Value, json};

use crate::auth::{Authority, TokenManager};
use crate::error::UpstreamError;
use crate::upstream::ApiPayload;

pub struct PortainerClient {
    client: reqwest::Client,
    tokens: Arc<TokenManager>,
    base_url: String,
}

impl PortainerClient {
    pub fn new(client: reqwest::Client, tokens: Arc<TokenManager>, base_url: String) -> Self {
        Self {
            client,
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, UpstreamError> {
        Url::parse(&format!("{}{}", self.base_url, path)).map_err(|e| {
            UpstreamError::Unavailable {
                reason: format!("invalid url for path {}: {}", path, e),
            }
        })
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<ApiPayload, UpstreamError> {
        super::call(
            &self.client,
            &self.tokens,
            Authority::Portainer,
            method,
            url,
            body,
        )
        .await
    }

    /// Require a JSON payload from an endpoint that must not return text.
    fn expect_json(payload: ApiPayload, what: &str) -> Result<Value, UpstreamError> {
        payload.into_json().ok_or_else(|| UpstreamError::Rejected {
            status: 200,
            body: format!("{} returned a non-JSON body", what),
        })
    }

    /// List all environments ("endpoints").
    pub async fn list_endpoints(&self) -> Result<Value, UpstreamError> {
        let payload = self.call(Method::GET, self.url("/api/endpoints")?, None).await?;
        Self::expect_json(payload, "endpoint list")
    }

    /// Ask the platform to refresh its own endpoint snapshots.
    ///
    /// Correctness signal only: the discoverer fires this before a rebuild
    /// and proceeds regardless of the outcome.
    pub async fn trigger_snapshot(&self) -> Result<(), UpstreamError> {
        self.call(Method::POST, self.url("/api/endpoints/snapshot")?, None)
            .await
            .map(|_| ())
    }

    /// Runtime info for one environment.
    pub async fn docker_info(&self, endpoint_id: i64) -> Result<Value, UpstreamError> {
        let url = self.url(&format!("/api/endpoints/{}/docker/info", endpoint_id))?;
        let payload = self.call(Method::GET, url, None).await?;
        Self::expect_json(payload, "docker info")
    }

    /// Runtime version for one environment.
    pub async fn docker_version(&self, endpoint_id: i64) -> Result<Value, UpstreamError> {
        let url = self.url(&format!("/api/endpoints/{}/docker/version", endpoint_id))?;
        let payload = self.call(Method::GET, url, None).await?;
        Self::expect_json(payload, "docker version")
    }

    /// Stacks deployed to one environment, orphaned stacks included.
    pub async fn list_stacks(&self, endpoint_id: i64) -> Result<Value, UpstreamError> {
        let mut url = self.url("/api/stacks")?;
        let filters = json!({ "EndpointID": endpoint_id, "IncludeOrphanedStacks": true });
        url.query_pairs_mut()
            .append_pair("filters", &filters.to_string());
        let payload = self.call(Method::GET, url, None).await?;
        Self::expect_json(payload, "stack list")
    }

    /// Full container list for one environment, stopped containers included.
    pub async fn list_containers(&self, endpoint_id: i64) -> Result<Value, UpstreamError> {
        let mut url = self.url(&format!(
            "/api/endpoints/{}/docker/containers/json",
            endpoint_id
        ))?;
        url.query_pairs_mut().append_pair("all", "true");
        let payload = self.call(Method::GET, url, None).await?;
        Self::expect_json(payload, "container list")
    }

    /// The platform-wide tag table.
    pub async fn list_tags(&self) -> Result<Value, UpstreamError> {
        let payload = self.call(Method::GET, self.url("/api/tags")?, None).await?;
        Self::expect_json(payload, "tag list")
    }

    /// Create a standalone stack from a compose string.
    pub async fn create_stack(
        &self,
        name: &str,
        endpoint_id: i64,
        compose: &str,
    ) -> Result<Value, UpstreamError> {
        let mut url = self.url("/api/stacks/create/standalone/string")?;
        url.query_pairs_mut()
            .append_pair("endpointId", &endpoint_id.to_string());
        let body = json!({
            "Name": name,
            "StackFileContent": compose,
            "Env": [],
            "FromAppTemplate": false,
        });
        let payload = self.call(Method::POST, url, Some(&body)).await?;
        Self::expect_json(payload, "stack create")
    }

    /// Update an existing stack in place.
    ///
    /// Prune stays off so services removed from the template are left
    /// running; image pull is forced so `latest`-style tags actually move.
    pub async fn update_stack(
        &self,
        stack_id: i64,
        endpoint_id: i64,
        compose: &str,
    ) -> Result<Value, UpstreamError> {
        let mut url = self.url(&format!("/api/stacks/{}", stack_id))?;
        url.query_pairs_mut()
            .append_pair("endpointId", &endpoint_id.to_string());
        let body = json!({
            "StackFileContent": compose,
            "Prune": false,
            "PullImage": true,
        });
        let payload = self.call(Method::PUT, url, Some(&body)).await?;
        Self::expect_json(payload, "stack update")
    }
}
