//! Configuration for deckhand.
//!
//! Everything resolves from environment variables (a `.env` file is loaded
//! via dotenvy early in startup). The Infisical section is optional: when
//! no client id is configured the secrets service is simply not wired and
//! deploys proceed with empty secret scopes.

pub(crate) mod helpers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use helpers::{optional_env, parse_env_or, required_env};

/// Portainer connection settings.
#[derive(Debug, Clone)]
pub struct PortainerConfig {
    /// Base URL, e.g. `https://portainer.example.com`.
    pub base_url: String,
    pub username: String,
    pub password: SecretString,
}

impl PortainerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: required_env("DECKHAND_PORTAINER_URL")?
                .trim_end_matches('/')
                .to_string(),
            username: required_env("DECKHAND_PORTAINER_USERNAME")?,
            password: SecretString::from(required_env("DECKHAND_PORTAINER_PASSWORD")?),
        })
    }
}

/// Infisical connection settings (universal auth).
#[derive(Debug, Clone)]
pub struct InfisicalConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Organization whose projects are snapshotted.
    pub organization_id: String,
}

impl InfisicalConfig {
    /// Returns `None` when `DECKHAND_INFISICAL_URL` is unset; the remaining
    /// variables become required once the URL is present.
    pub(crate) fn resolve() -> Result<Option<Self>, ConfigError> {
        let Some(base_url) = optional_env("DECKHAND_INFISICAL_URL") else {
            return Ok(None);
        };
        Ok(Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: required_env("DECKHAND_INFISICAL_CLIENT_ID")?,
            client_secret: SecretString::from(required_env("DECKHAND_INFISICAL_CLIENT_SECRET")?),
            organization_id: required_env("DECKHAND_INFISICAL_ORG_ID")?,
        }))
    }
}

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub portainer: PortainerConfig,
    pub infisical: Option<InfisicalConfig>,
    /// Working directory: templates live under it, state is mirrored into it.
    pub workdir: PathBuf,
    /// Directory scanned for template definitions.
    pub templates_dir: PathBuf,
    /// Address the dashboard-facing API listens on.
    pub listen: SocketAddr,
    /// Per-request timeout applied at the HTTP client level.
    pub http_timeout: Duration,
    /// Overall deadline for a single snapshot rebuild.
    pub rebuild_deadline: Duration,
    /// Background token refresh interval; zero disables the refresher.
    pub token_refresh_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let workdir = PathBuf::from(
            optional_env("DECKHAND_WORKDIR").unwrap_or_else(|| "./deckhand".to_string()),
        );
        let templates_dir = optional_env("DECKHAND_TEMPLATES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workdir.join("templates"));

        let listen_raw =
            optional_env("DECKHAND_LISTEN").unwrap_or_else(|| "127.0.0.1:9402".to_string());
        let listen = listen_raw.parse().map_err(|_| ConfigError::InvalidVar {
            var: "DECKHAND_LISTEN".to_string(),
            reason: format!("'{}' is not a socket address", listen_raw),
        })?;

        Ok(Self {
            portainer: PortainerConfig::resolve()?,
            infisical: InfisicalConfig::resolve()?,
            workdir,
            templates_dir,
            listen,
            http_timeout: Duration::from_secs(parse_env_or("DECKHAND_HTTP_TIMEOUT_SECS", 30u64)?),
            rebuild_deadline: Duration::from_secs(parse_env_or(
                "DECKHAND_REBUILD_DEADLINE_SECS",
                120u64,
            )?),
            token_refresh_interval: Duration::from_secs(parse_env_or(
                "DECKHAND_TOKEN_REFRESH_SECS",
                0u64,
            )?),
        })
    }

    /// Directory the snapshot documents and audit renders are written to.
    pub fn state_dir(&self) -> PathBuf {
        self.workdir.join("state")
    }
}
