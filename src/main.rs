//! deckhand — main entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use deckhand::auth::TokenManager;
use deckhand::config::Config;
use deckhand::deploy::Deployer;
use deckhand::server::{Api, AppState};
use deckhand::snapshot::environments::EnvironmentDiscoverer;
use deckhand::snapshot::projects::ProjectsCache;
use deckhand::snapshot::templates::TemplateCatalog;
use deckhand::snapshot::{ENVIRONMENTS_TTL, PROJECTS_TTL, SnapshotCell, TEMPLATES_TTL};
use deckhand::upstream::{InfisicalClient, PortainerClient};

#[derive(Parser, Debug)]
#[command(name = "deckhand")]
#[command(about = "Snapshot-and-deploy middleman for Portainer and Infisical")]
#[command(version)]
struct Args {
    /// Skip the startup snapshot warm-up; caches fill on first access.
    #[arg(long)]
    no_warmup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deckhand=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env()?;
    tracing::info!(portainer = %config.portainer.base_url, "starting deckhand");

    let state_dir = config.state_dir();
    tokio::fs::create_dir_all(&state_dir).await?;

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    let tokens = Arc::new(TokenManager::new(
        client.clone(),
        config.portainer.clone(),
        config.infisical.clone(),
    ));

    let portainer = Arc::new(PortainerClient::new(
        client.clone(),
        Arc::clone(&tokens),
        config.portainer.base_url.clone(),
    ));
    let infisical = config.infisical.as_ref().map(|infisical| {
        Arc::new(InfisicalClient::new(
            client.clone(),
            Arc::clone(&tokens),
            infisical.base_url.clone(),
            infisical.organization_id.clone(),
        ))
    });
    if infisical.is_none() {
        tracing::warn!("secrets service not configured, deploys will render with empty secret maps");
    }

    let environments = Arc::new(EnvironmentDiscoverer::new(
        Arc::clone(&portainer),
        SnapshotCell::new(
            "environments",
            ENVIRONMENTS_TTL,
            config.rebuild_deadline,
            &state_dir,
        ),
    ));
    let projects = Arc::new(ProjectsCache::new(
        infisical.clone(),
        SnapshotCell::new(
            "secrets_projects",
            PROJECTS_TTL,
            config.rebuild_deadline,
            &state_dir,
        ),
    ));
    let templates = Arc::new(TemplateCatalog::new(
        config.templates_dir.clone(),
        SnapshotCell::new(
            "template_catalog",
            TEMPLATES_TTL,
            config.rebuild_deadline,
            &state_dir,
        ),
    ));

    if !args.no_warmup {
        // Restore from disk where still fresh; rebuild the rest. Failures
        // are logged — the service comes up even with upstreams down.
        if !environments.restore().await {
            if let Err(err) = environments.ensure(true).await {
                tracing::warn!(error = %err, "startup environments rebuild failed");
            }
        }
        if !projects.restore().await {
            if let Err(err) = projects.ensure(true).await {
                tracing::warn!(error = %err, "startup projects rebuild failed");
            }
        }
        if !templates.restore().await {
            if let Err(err) = templates.ensure(true).await {
                tracing::warn!(error = %err, "startup template scan failed");
            }
        }
    }

    let refresher = (config.token_refresh_interval > Duration::ZERO)
        .then(|| tokens.start_refresh(config.token_refresh_interval));
    if refresher.is_some() {
        tracing::info!(
            interval_secs = config.token_refresh_interval.as_secs(),
            "background token refresh enabled"
        );
    }

    let deployer = Arc::new(Deployer::new(
        Arc::clone(&portainer),
        infisical.clone(),
        Arc::clone(&environments),
        Arc::clone(&projects),
        Arc::clone(&templates),
        state_dir,
    ));

    let state = AppState {
        environments,
        projects,
        templates,
        deployer,
    };

    Api::start(state, config.listen)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if let Some(refresher) = refresher {
        refresher.stop();
    }
    tracing::info!("deckhand stopped");
    Ok(())
}
