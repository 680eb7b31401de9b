//! Short-lived bearer credentials for the two upstream authorities.
//!
//! Tokens are obtained by logging in with configured credentials and cached
//! until their JWT `exp` claim comes within [`REFRESH_SKEW_SECS`] of now.
//! A failed refresh falls back to the previous token: upstream clients
//! treat the resulting 401/403 as a signal to force-refresh and retry once,
//! so a flapping login endpoint degrades latency, not availability.
//!
//! Concurrent `ensure_token` calls for one authority are collapsed: the
//! per-authority mutex is held across the login, and late arrivals re-check
//! freshness under the lock instead of issuing a second login.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{InfisicalConfig, PortainerConfig};
use crate::error::AuthError;

/// Refresh the token once its remaining lifetime drops to this many seconds.
pub const REFRESH_SKEW_SECS: i64 = 600;

/// The two independent token authorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Portainer,
    Infisical,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Portainer => "portainer",
            Self::Infisical => "infisical",
        }
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cached credential for one authority. Never serialized, never logged.
#[derive(Default)]
struct TokenState {
    token: Option<String>,
    /// Epoch seconds from the JWT `exp` claim; 0 forces a refresh.
    expires_at: i64,
}

impl TokenState {
    fn is_fresh(&self, now: i64) -> bool {
        self.token.is_some() && self.expires_at - now > REFRESH_SKEW_SECS
    }
}

/// Extract the `exp` claim from a JWT without verifying the signature.
///
/// Only the expiry is read, so the payload segment is base64-decoded
/// directly. Tokens without a parsable `exp` are treated as already stale.
fn decode_expiry(token: &str) -> Option<i64> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<Claims>(&bytes).ok().map(|c| c.exp)
}

/// Obtains and caches bearer tokens for both authorities.
pub struct TokenManager {
    client: reqwest::Client,
    portainer: PortainerConfig,
    infisical: Option<InfisicalConfig>,
    portainer_state: Mutex<TokenState>,
    infisical_state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(
        client: reqwest::Client,
        portainer: PortainerConfig,
        infisical: Option<InfisicalConfig>,
    ) -> Self {
        Self {
            client,
            portainer,
            infisical,
            portainer_state: Mutex::new(TokenState::default()),
            infisical_state: Mutex::new(TokenState::default()),
        }
    }

    fn state_for(&self, authority: Authority) -> &Mutex<TokenState> {
        match authority {
            Authority::Portainer => &self.portainer_state,
            Authority::Infisical => &self.infisical_state,
        }
    }

    /// Return a token for the authority, logging in only when the cached
    /// one is missing or close to expiry.
    ///
    /// On login failure the previous token is returned if one exists;
    /// `AuthError::RefreshFailed` is raised only when the authority has
    /// never produced a token.
    pub async fn ensure_token(&self, authority: Authority) -> Result<String, AuthError> {
        let mut state = self.state_for(authority).lock().await;

        let now = chrono::Utc::now().timestamp();
        if state.is_fresh(now) {
            // Also covers callers that queued behind an in-flight login.
            return Ok(state.token.clone().unwrap_or_default());
        }

        match self.login(authority).await {
            Ok(token) => {
                state.expires_at = decode_expiry(&token).unwrap_or(0);
                state.token = Some(token.clone());
                tracing::debug!(%authority, expires_at = state.expires_at, "refreshed api token");
                Ok(token)
            }
            Err(err) => match &state.token {
                Some(previous) => {
                    tracing::warn!(%authority, error = %err, "token refresh failed, reusing previous token");
                    Ok(previous.clone())
                }
                None => Err(err),
            },
        }
    }

    /// Drop the cached expiry so the next `ensure_token` logs in again.
    ///
    /// Called by upstream clients after a 401/403.
    pub async fn force_refresh(&self, authority: Authority) {
        let mut state = self.state_for(authority).lock().await;
        state.expires_at = 0;
    }

    async fn login(&self, authority: Authority) -> Result<String, AuthError> {
        match authority {
            Authority::Portainer => self.login_portainer().await,
            Authority::Infisical => self.login_infisical().await,
        }
    }

    async fn login_portainer(&self) -> Result<String, AuthError> {
        #[derive(Deserialize)]
        struct LoginResponse {
            jwt: String,
        }

        let url = format!("{}/api/auth", self.portainer.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": self.portainer.username,
                "password": self.portainer.password.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed {
                authority: Authority::Portainer.as_str().to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::RefreshFailed {
                authority: Authority::Portainer.as_str().to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let body: LoginResponse =
            response.json().await.map_err(|e| AuthError::RefreshFailed {
                authority: Authority::Portainer.as_str().to_string(),
                reason: format!("unexpected login payload: {}", e),
            })?;
        Ok(body.jwt)
    }

    async fn login_infisical(&self) -> Result<String, AuthError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LoginResponse {
            access_token: String,
        }

        let config = self.infisical.as_ref().ok_or_else(|| AuthError::RefreshFailed {
            authority: Authority::Infisical.as_str().to_string(),
            reason: "secrets service not configured".to_string(),
        })?;

        let url = format!("{}/api/v1/auth/universal-auth/login", config.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "clientId": config.client_id,
                "clientSecret": config.client_secret.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed {
                authority: Authority::Infisical.as_str().to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::RefreshFailed {
                authority: Authority::Infisical.as_str().to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let body: LoginResponse =
            response.json().await.map_err(|e| AuthError::RefreshFailed {
                authority: Authority::Infisical.as_str().to_string(),
                reason: format!("unexpected login payload: {}", e),
            })?;
        Ok(body.access_token)
    }

    /// Spawn a background task that keeps both authorities' tokens warm so
    /// foreground requests rarely pay the login latency.
    ///
    /// Errors are swallowed: `ensure_token` already degrades to the
    /// previous token, and the next tick retries.
    pub fn start_refresh(self: &Arc<Self>, interval: Duration) -> RefreshHandle {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.ensure_token(Authority::Portainer).await {
                    tracing::debug!(error = %err, "background portainer token refresh failed");
                }
                if manager.infisical.is_some() {
                    if let Err(err) = manager.ensure_token(Authority::Infisical).await {
                        tracing::debug!(error = %err, "background infisical token refresh failed");
                    }
                }
            }
        });
        RefreshHandle { handle }
    }
}

/// Handle to the background token refresher; `stop` aborts the task.
pub struct RefreshHandle {
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use secrecy::SecretString;

    fn fake_jwt(exp: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"x","exp":{}}}"#, exp));
        format!("eyJhbGciOiJIUzI1NiJ9.{}.c2ln", payload)
    }

    fn manager_with_unreachable_upstreams() -> TokenManager {
        TokenManager::new(
            reqwest::Client::new(),
            PortainerConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                username: "admin".to_string(),
                password: SecretString::from("pw"),
            },
            None,
        )
    }

    #[test]
    fn test_decode_expiry_reads_exp_claim() {
        assert_eq!(decode_expiry(&fake_jwt(1_900_000_000)), Some(1_900_000_000));
    }

    #[test]
    fn test_decode_expiry_rejects_garbage() {
        assert_eq!(decode_expiry("not-a-jwt"), None);
        assert_eq!(decode_expiry("a.%%%.c"), None);
    }

    #[test]
    fn test_token_state_freshness_skew() {
        let state = TokenState {
            token: Some("t".to_string()),
            expires_at: 10_000,
        };
        // 601 seconds of remaining lifetime: fresh.
        assert!(state.is_fresh(10_000 - 601));
        // Exactly at the skew boundary: stale.
        assert!(!state.is_fresh(10_000 - 600));
        assert!(!state.is_fresh(10_000));
    }

    #[tokio::test]
    async fn test_ensure_token_returns_cached_without_login() {
        let manager = manager_with_unreachable_upstreams();
        {
            let mut state = manager.portainer_state.lock().await;
            state.token = Some("cached".to_string());
            state.expires_at = chrono::Utc::now().timestamp() + 100_000;
        }
        // The login endpoint is unreachable, so this only passes if the
        // cached token short-circuits the network call.
        let token = manager.ensure_token(Authority::Portainer).await.unwrap();
        assert_eq!(token, "cached");
    }

    #[tokio::test]
    async fn test_failed_refresh_reuses_previous_token() {
        let manager = manager_with_unreachable_upstreams();
        {
            let mut state = manager.portainer_state.lock().await;
            state.token = Some("stale".to_string());
            state.expires_at = 0;
        }
        let token = manager.ensure_token(Authority::Portainer).await.unwrap();
        assert_eq!(token, "stale");
    }

    #[tokio::test]
    async fn test_failed_refresh_without_previous_token_errors() {
        let manager = manager_with_unreachable_upstreams();
        let err = manager.ensure_token(Authority::Portainer).await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn test_force_refresh_marks_token_stale() {
        let manager = manager_with_unreachable_upstreams();
        {
            let mut state = manager.portainer_state.lock().await;
            state.token = Some("old".to_string());
            state.expires_at = chrono::Utc::now().timestamp() + 100_000;
        }
        manager.force_refresh(Authority::Portainer).await;
        let state = manager.portainer_state.lock().await;
        assert!(!state.is_fresh(chrono::Utc::now().timestamp()));
    }
}
