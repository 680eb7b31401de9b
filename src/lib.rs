//! deckhand — snapshot-and-deploy middleman between an operator dashboard
//! and two upstream control planes: a Portainer-compatible orchestration
//! API and an Infisical-compatible secrets API.
//!
//! The library keeps freshness-bounded snapshots of upstream state, manages
//! short-lived bearer credentials for both authorities, and resolves
//! "deploy this template into this environment" requests into concrete
//! create-or-update calls enriched with secrets.

pub mod auth;
pub mod config;
pub mod deploy;
pub mod error;
pub mod server;
pub mod snapshot;
pub mod upstream;

pub use config::Config;
pub use deploy::{DeployRequest, Deployer};
pub use error::{AuthError, ConfigError, DeployError, SnapshotError, UpstreamError};
