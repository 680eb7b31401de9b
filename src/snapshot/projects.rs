//! Secrets-projects snapshot: the organization's projects indexed by name,
//! each with its environments indexed by slug.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SnapshotError, UpstreamError};
use crate::snapshot::{Snapshot, SnapshotCell};
use crate::upstream::InfisicalClient;

/// One environment within a secrets project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectEnvironment {
    #[serde(default)]
    pub name: String,
    pub slug: String,
}

/// One secrets project ("workspace").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub environments: BTreeMap<String, ProjectEnvironment>,
    #[serde(default)]
    pub environment_count: usize,
}

/// Domain payload of the secrets-projects snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectsData {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectRecord>,
}

#[derive(Deserialize)]
struct WorkspacesPayload {
    #[serde(default)]
    workspaces: Vec<WorkspacePayload>,
}

#[derive(Deserialize)]
struct WorkspacePayload {
    id: String,
    name: String,
    #[serde(default)]
    environments: Vec<ProjectEnvironment>,
}

fn index_workspaces(payload: WorkspacesPayload) -> ProjectsData {
    let mut data = ProjectsData::default();
    for workspace in payload.workspaces {
        let environments: BTreeMap<String, ProjectEnvironment> = workspace
            .environments
            .iter()
            .map(|env| (env.slug.clone(), env.clone()))
            .collect();
        data.projects.insert(
            workspace.name.clone(),
            ProjectRecord {
                id: workspace.id,
                name: workspace.name,
                environment_count: workspace.environments.len(),
                environments,
            },
        );
    }
    data
}

/// Rebuilds and owns the secrets-projects snapshot.
///
/// When the secrets service is not configured the cache simply stays
/// empty; `ensure` is a no-op rather than an error.
pub struct ProjectsCache {
    infisical: Option<Arc<InfisicalClient>>,
    cell: SnapshotCell<ProjectsData>,
}

impl ProjectsCache {
    pub fn new(infisical: Option<Arc<InfisicalClient>>, cell: SnapshotCell<ProjectsData>) -> Self {
        Self { infisical, cell }
    }

    pub async fn snapshot(&self) -> Snapshot<ProjectsData> {
        self.cell.read().await
    }

    pub async fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.cell.timestamp().await
    }

    pub async fn restore(&self) -> bool {
        self.cell.restore().await
    }

    pub async fn ensure(&self, force: bool) -> Result<Option<Value>, SnapshotError> {
        let Some(infisical) = self.infisical.as_deref() else {
            return Ok(None);
        };
        self.cell
            .ensure(force, || async {
                let raw = infisical.list_projects().await?;
                let payload: WorkspacesPayload = serde_json::from_value(raw.clone())
                    .map_err(|e| {
                        SnapshotError::Upstream(UpstreamError::Rejected {
                            status: 200,
                            body: format!("unexpected workspace list payload: {}", e),
                        })
                    })?;
                let data = index_workspaces(payload);
                tracing::info!(projects = data.projects.len(), "secrets projects snapshot rebuilt");
                Ok((data, raw))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_workspaces_by_name_and_slug() {
        let payload: WorkspacesPayload = serde_json::from_value(json!({
            "workspaces": [
                {
                    "id": "ws-1",
                    "name": "prod",
                    "environments": [
                        { "name": "Production", "slug": "live" },
                        { "name": "Staging", "slug": "staging" },
                    ],
                },
                { "id": "ws-2", "name": "empty" },
            ]
        }))
        .unwrap();

        let data = index_workspaces(payload);
        let prod = &data.projects["prod"];
        assert_eq!(prod.id, "ws-1");
        assert_eq!(prod.environment_count, 2);
        assert_eq!(prod.environments["live"].name, "Production");
        assert_eq!(data.projects["empty"].environment_count, 0);
    }

    #[tokio::test]
    async fn test_ensure_is_noop_without_secrets_service() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProjectsCache::new(
            None,
            SnapshotCell::new(
                "secrets_projects",
                std::time::Duration::from_secs(300),
                std::time::Duration::from_secs(5),
                dir.path(),
            ),
        );
        assert!(cache.ensure(true).await.unwrap().is_none());
        assert!(cache.snapshot().await.data.projects.is_empty());
    }
}
