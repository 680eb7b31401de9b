//! The deploy use case: resolve a template and target environment against
//! the current snapshots, pull secrets for two scopes, render the
//! template, and issue a create-or-update call against the orchestration
//! platform.
//!
//! Deploy reads whatever the caches currently hold — it never forces a
//! refresh up front. After a successful upstream call all three caches
//! are force-rebuilt so the next read reflects the new deployment; the
//! operation is not transactional, and a failed rebuild only means the
//! in-memory view stays stale until the next TTL or forced refresh.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use minijinja::{AutoEscape, Environment};
use serde::Deserialize;

use crate::error::DeployError;
use crate::snapshot::environments::EnvironmentDiscoverer;
use crate::snapshot::projects::ProjectsCache;
use crate::snapshot::templates::TemplateCatalog;
use crate::upstream::{InfisicalClient, PortainerClient};

/// Secrets project holding template-scoped secrets:
/// `deckhand_templates_<fileName>`, shared across every deployment of that
/// template.
pub const TEMPLATE_SECRETS_PREFIX: &str = "deckhand_templates_";

/// Secrets environment slug used when a template does not declare one.
pub const DEFAULT_SECRETS_ENV: &str = "live";

/// A deploy request as submitted by the dashboard.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub template_key: String,
    pub environment: String,
    #[serde(default)]
    pub is_already_deployed: bool,
    /// Required when `is_already_deployed`.
    #[serde(default)]
    pub stack_id: Option<i64>,
    /// Required when not yet deployed.
    #[serde(default)]
    pub stack_name: Option<String>,
}

enum Target {
    Create { stack_name: String },
    Update { stack_id: i64 },
}

/// Render the template body with escaped-by-default interpolation.
///
/// Values are JSON-escaped, which keeps interpolated strings safe inside
/// the YAML deployment definition. Context namespaces: `env` (process
/// environment), `secrets` (target-environment scope), `shared`
/// (template scope).
fn render_template(
    body: &str,
    process_env: &BTreeMap<String, String>,
    secrets: &BTreeMap<String, String>,
    shared: &BTreeMap<String, String>,
) -> Result<String, DeployError> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::Json);
    env.render_str(
        body,
        minijinja::context! { env => process_env, secrets => secrets, shared => shared },
    )
    .map_err(|e| DeployError::Render(e.to_string()))
}

#[derive(Deserialize)]
struct SecretsPayload {
    #[serde(default)]
    secrets: Vec<SecretEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretEntry {
    secret_key: String,
    #[serde(default)]
    secret_value: String,
}

/// Top-level deploy orchestrator.
pub struct Deployer {
    portainer: Arc<PortainerClient>,
    infisical: Option<Arc<InfisicalClient>>,
    environments: Arc<EnvironmentDiscoverer>,
    projects: Arc<ProjectsCache>,
    templates: Arc<TemplateCatalog>,
    state_dir: PathBuf,
    /// Deploy scopes that silently substituted an empty secret list.
    missing_scope_warnings: AtomicU64,
}

impl Deployer {
    pub fn new(
        portainer: Arc<PortainerClient>,
        infisical: Option<Arc<InfisicalClient>>,
        environments: Arc<EnvironmentDiscoverer>,
        projects: Arc<ProjectsCache>,
        templates: Arc<TemplateCatalog>,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            portainer,
            infisical,
            environments,
            projects,
            templates,
            state_dir,
            missing_scope_warnings: AtomicU64::new(0),
        }
    }

    /// How many secret scopes resolved to an empty substitute so far.
    ///
    /// Deploys tolerate a missing secrets project by design; this counter
    /// makes the substitution observable.
    pub fn missing_scope_warnings(&self) -> u64 {
        self.missing_scope_warnings.load(Ordering::Relaxed)
    }

    /// Execute a deploy and return the rendered deployment definition.
    ///
    /// Validation happens before any upstream call; a `Validation` error
    /// guarantees nothing was sent anywhere.
    pub async fn deploy(&self, request: DeployRequest) -> Result<String, DeployError> {
        if request.environment.trim().is_empty() {
            return Err(DeployError::Validation(
                "target environment must not be empty".to_string(),
            ));
        }
        if request.template_key.trim().is_empty() {
            return Err(DeployError::Validation(
                "template key must not be empty".to_string(),
            ));
        }

        let environments = self.environments.snapshot().await;
        let environment = environments
            .data
            .envs
            .get(&request.environment)
            .ok_or_else(|| {
                DeployError::Validation(format!(
                    "unknown environment '{}'",
                    request.environment
                ))
            })?
            .clone();

        let templates = self.templates.snapshot().await;
        let template = templates
            .data
            .templates
            .get(&request.template_key)
            .ok_or_else(|| {
                DeployError::Validation(format!("unknown template '{}'", request.template_key))
            })?
            .clone();

        let target = if request.is_already_deployed {
            let stack_id = request.stack_id.ok_or_else(|| {
                DeployError::Validation(
                    "stack id is required when the stack is already deployed".to_string(),
                )
            })?;
            Target::Update { stack_id }
        } else {
            let stack_name = request
                .stack_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| {
                    DeployError::Validation(
                        "stack name is required for a first deployment".to_string(),
                    )
                })?
                .to_string();
            Target::Create { stack_name }
        };

        let slug = template
            .metadata
            .infisical_env
            .clone()
            .unwrap_or_else(|| DEFAULT_SECRETS_ENV.to_string());

        let template_project = format!("{}{}", TEMPLATE_SECRETS_PREFIX, template.file_name);
        let (secrets, shared) = tokio::join!(
            self.resolve_scope(&environment.name, &slug),
            self.resolve_scope(&template_project, &slug),
        );

        let process_env: BTreeMap<String, String> = std::env::vars().collect();
        let rendered = render_template(&template.body, &process_env, &secrets, &shared)?;

        match &target {
            Target::Update { stack_id } => {
                tracing::info!(
                    template = %request.template_key,
                    environment = %environment.name,
                    stack_id,
                    "updating existing stack"
                );
                self.portainer
                    .update_stack(*stack_id, environment.id, &rendered)
                    .await?;
            }
            Target::Create { stack_name } => {
                tracing::info!(
                    template = %request.template_key,
                    environment = %environment.name,
                    stack = %stack_name,
                    "creating stack"
                );
                self.portainer
                    .create_stack(stack_name, environment.id, &rendered)
                    .await?;
            }
        }

        self.refresh_all_caches().await;
        self.write_audit_copy(&request, &environment.name, &target, &rendered)
            .await;

        Ok(rendered)
    }

    /// Resolve one secret scope to a flat key→value map.
    ///
    /// A missing project, unconfigured secrets service, or failed fetch
    /// substitutes an empty map — counted and logged, never fatal to the
    /// deploy.
    async fn resolve_scope(&self, project_name: &str, slug: &str) -> BTreeMap<String, String> {
        let Some(infisical) = self.infisical.as_deref() else {
            self.count_missing_scope(project_name, "secrets service not configured");
            return BTreeMap::new();
        };

        let projects = self.projects.snapshot().await;
        let Some(project) = projects.data.projects.get(project_name) else {
            self.count_missing_scope(project_name, "no matching secrets project");
            return BTreeMap::new();
        };

        let raw = match infisical.list_secrets(&project.id, slug).await {
            Ok(raw) => raw,
            Err(err) => {
                self.count_missing_scope(project_name, &err.to_string());
                return BTreeMap::new();
            }
        };

        match serde_json::from_value::<SecretsPayload>(raw) {
            Ok(payload) => payload
                .secrets
                .into_iter()
                .map(|entry| (entry.secret_key, entry.secret_value))
                .collect(),
            Err(err) => {
                self.count_missing_scope(project_name, &format!("unexpected payload: {}", err));
                BTreeMap::new()
            }
        }
    }

    fn count_missing_scope(&self, project_name: &str, reason: &str) {
        self.missing_scope_warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(project = %project_name, reason, "secret scope resolved empty");
    }

    /// Force-rebuild all three snapshots after a deploy. Failures are
    /// logged, not raised — the deploy already happened.
    async fn refresh_all_caches(&self) {
        let (envs, projects, templates) = tokio::join!(
            self.environments.ensure(true),
            self.projects.ensure(true),
            self.templates.ensure(true),
        );
        if let Err(err) = envs {
            tracing::warn!(error = %err, "post-deploy environments rebuild failed");
        }
        if let Err(err) = projects {
            tracing::warn!(error = %err, "post-deploy projects rebuild failed");
        }
        if let Err(err) = templates {
            tracing::warn!(error = %err, "post-deploy template rebuild failed");
        }
    }

    /// Keep a copy of what was actually sent upstream, keyed by
    /// template/environment/stack. Advisory only.
    async fn write_audit_copy(
        &self,
        request: &DeployRequest,
        environment: &str,
        target: &Target,
        rendered: &str,
    ) {
        let stack = match target {
            Target::Create { stack_name } => stack_name.clone(),
            Target::Update { stack_id } => stack_id.to_string(),
        };
        let file_name = format!("{}__{}__{}.yaml", request.template_key, environment, stack)
            .replace('/', "_");
        let dir = self.state_dir.join("renders");

        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %err, "could not create render audit directory");
            return;
        }
        if let Err(err) = tokio::fs::write(dir.join(&file_name), rendered).await {
            tracing::warn!(file = %file_name, error = %err, "could not write render audit copy");
        }
    }
}
