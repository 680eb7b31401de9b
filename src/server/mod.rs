//! Dashboard-facing HTTP API.
//!
//! Snapshot routes ensure freshness and answer with whatever the cache
//! then holds — a failed rebuild degrades to the last-known snapshot with
//! a warning rather than an error, since a stale view is still useful to
//! the dashboard. Deploy failures do map to error responses.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::deploy::{DeployRequest, Deployer};
use crate::error::DeployError;
use crate::snapshot::environments::EnvironmentDiscoverer;
use crate::snapshot::projects::ProjectsCache;
use crate::snapshot::templates::TemplateCatalog;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub environments: Arc<EnvironmentDiscoverer>,
    pub projects: Arc<ProjectsCache>,
    pub templates: Arc<TemplateCatalog>,
    pub deployer: Arc<Deployer>,
}

pub struct Api;

impl Api {
    /// Build the axum router for the dashboard surface.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/snapshots/environments", post(snapshot_environments))
            .route("/snapshots/projects", post(snapshot_projects))
            .route("/snapshots/templates", post(snapshot_templates))
            .route("/snapshots", post(snapshot_all))
            .route("/deploy", post(deploy))
            .with_state(state)
    }

    /// Bind and serve until ctrl-c.
    pub async fn start(
        state: AppState,
        addr: std::net::SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = Self::router(state);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("deckhand api listening on {}", addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnsureParams {
    #[serde(default)]
    force: bool,
}

async fn health() -> &'static str {
    "ok"
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

async fn snapshot_environments(
    State(state): State<AppState>,
    Query(params): Query<EnsureParams>,
) -> Json<Value> {
    if let Err(err) = state.environments.ensure(params.force).await {
        tracing::warn!(error = %err, "environments refresh failed, serving last snapshot");
    }
    Json(to_json(&state.environments.snapshot().await))
}

async fn snapshot_projects(
    State(state): State<AppState>,
    Query(params): Query<EnsureParams>,
) -> Json<Value> {
    if let Err(err) = state.projects.ensure(params.force).await {
        tracing::warn!(error = %err, "projects refresh failed, serving last snapshot");
    }
    Json(to_json(&state.projects.snapshot().await))
}

async fn snapshot_templates(
    State(state): State<AppState>,
    Query(params): Query<EnsureParams>,
) -> Json<Value> {
    if let Err(err) = state.templates.ensure(params.force).await {
        tracing::warn!(error = %err, "template refresh failed, serving last snapshot");
    }
    Json(to_json(&state.templates.snapshot().await))
}

/// Combined fetch: ensure all three, answer with one document.
async fn snapshot_all(
    State(state): State<AppState>,
    Query(params): Query<EnsureParams>,
) -> Json<Value> {
    let (envs, projects, templates) = tokio::join!(
        state.environments.ensure(params.force),
        state.projects.ensure(params.force),
        state.templates.ensure(params.force),
    );
    for (name, result) in [
        ("environments", envs),
        ("projects", projects),
        ("templates", templates),
    ] {
        if let Err(err) = result {
            tracing::warn!(snapshot = name, error = %err, "refresh failed, serving last snapshot");
        }
    }

    Json(json!({
        "environments": to_json(&state.environments.snapshot().await),
        "projects": to_json(&state.projects.snapshot().await),
        "templates": to_json(&state.templates.snapshot().await),
    }))
}

async fn deploy(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.deployer.deploy(request).await {
        Ok(rendered) => Ok(Json(json!({ "rendered": rendered }))),
        Err(err) => {
            let status = match &err {
                DeployError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                DeployError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
                DeployError::Upstream(_) => StatusCode::BAD_GATEWAY,
            };
            tracing::warn!(error = %err, "deploy failed");
            Err((status, Json(json!({ "message": err.to_string() }))))
        }
    }
}
