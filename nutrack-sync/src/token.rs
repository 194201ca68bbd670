//! Access token lifecycle
//!
//! Wraps the credential vault and refreshes the access token when it is
//! close to expiry. Nothing here retries; callers apply their own backoff.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::vault::{CredentialVault, Credentials};
use crate::{Error, Result};

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 4 * 60 * 60;

/// Upper bound on a lifetime reported by the token endpoint
const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 60 * 60;

/// Token endpoint response for both grant types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
}

impl TokenResponse {
    fn lifetime(&self) -> ChronoDuration {
        let secs = match self.expires_in {
            0 => DEFAULT_EXPIRES_IN_SECS,
            secs if secs > MAX_EXPIRES_IN_SECS => {
                warn!("Token endpoint reported expires_in={}, capping at one year", secs);
                MAX_EXPIRES_IN_SECS
            }
            secs => secs,
        };
        ChronoDuration::seconds(secs as i64)
    }
}

/// OAuth2 token endpoint
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code obtained through the PKCE flow.
    async fn exchange(&self, code: &str, code_verifier: &str) -> Result<TokenResponse>;

    /// Obtain a new access token from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

/// Hands out valid credentials, refreshing them when needed
pub struct TokenManager {
    vault: Arc<CredentialVault>,
    endpoint: Arc<dyn TokenEndpoint>,
    refresh_window: ChronoDuration,
}

impl TokenManager {
    pub fn new(
        vault: Arc<CredentialVault>,
        endpoint: Arc<dyn TokenEndpoint>,
        refresh_window: Duration,
    ) -> Self {
        Self {
            vault,
            endpoint,
            refresh_window: ChronoDuration::from_std(refresh_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(30)),
        }
    }

    /// Return credentials that stay valid for at least the refresh window.
    pub async fn get_valid(&self) -> Result<Credentials> {
        self.get_valid_at(Utc::now()).await
    }

    async fn get_valid_at(&self, now: DateTime<Utc>) -> Result<Credentials> {
        let credentials = self
            .vault
            .load()?
            .filter(|c| !c.access_token.is_empty())
            .ok_or_else(|| Error::Unauthenticated("no credentials stored".to_string()))?;

        let remaining = credentials.expires_at - now;
        debug!("Access token expires in {}s", remaining.num_seconds());
        if remaining > self.refresh_window {
            return Ok(credentials);
        }

        let refresh_token = credentials.refresh_token.clone().ok_or_else(|| {
            Error::Unauthenticated("access token expiring and no refresh token stored".to_string())
        })?;

        info!("Refreshing access token");
        let response = self.endpoint.refresh(&refresh_token).await.map_err(|e| {
            warn!("Token refresh failed: {}", e);
            Error::RefreshFailed(Box::new(e))
        })?;

        if response.refresh_token.is_none() {
            debug!("No new refresh token received, keeping existing one");
        }

        // Refreshed tokens use the full lifetime, unlike the initial exchange.
        let refreshed = Credentials {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone().or(Some(refresh_token)),
            expires_at: now + response.lifetime(),
        };
        self.vault.save(&refreshed)?;

        info!("Access token refreshed, expires at {}", refreshed.expires_at);
        Ok(refreshed)
    }

    /// Exchange an authorization code and persist the resulting credentials.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Credentials> {
        let response = self.endpoint.exchange(code, code_verifier).await?;
        if response.access_token.is_empty() {
            return Err(Error::Unauthenticated(
                "no access token received in response".to_string(),
            ));
        }

        // Initial exchange keeps a 10% safety margin on the lifetime.
        let lifetime = response.lifetime() * 9 / 10;
        let credentials = Credentials {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: Utc::now() + lifetime,
        };
        self.vault.save(&credentials)?;

        info!("Stored new credentials, expires at {}", credentials.expires_at);
        Ok(credentials)
    }

    /// True iff credentials exist and can be made valid right now.
    pub async fn is_authenticated(&self) -> bool {
        match self.get_valid().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Not authenticated: {}", e);
                false
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.vault.delete()
    }
}
